//! Session lifecycle: establishing, routing to, and tearing down relayed sessions.

pub mod manager;

pub use manager::{ClientRegistry, EstablishedSession, SessionManager};
