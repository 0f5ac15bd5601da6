//! mcp-proxy-core: session relay core for the MCP proxy.
//!
//! Provides the abstract transport trait and its event channel, JSON line and
//! SSE stream decoders, the session registry, and the bidirectional relay that
//! pairs a client-facing transport with a server-facing one.

pub mod codec;
pub mod error;
pub mod registry;
pub mod relay;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{LineDecoder, SseDecoder, SseEvent};
pub use error::{RelayError, RelayResult};
pub use registry::{generate_session_id, SessionRegistry};
pub use relay::{relay, ErrorCallback, RelayHandle, RelayState};
pub use transport::{BoxFuture, EventChannel, EventReceiver, JsonRpcMessage, Transport, TransportEvent};
