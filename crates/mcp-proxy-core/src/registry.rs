//! Session registry for client-facing transports.
//!
//! Maps session ids to the transport serving that session so that messages
//! posted out-of-band (e.g. `POST /message?sessionId=...`) can be routed to
//! the right stream. Entries are weak: the session owns its transport, the
//! registry only finds it.

use crate::error::{RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::info;

/// Registry of live sessions, keyed by session id.
pub struct SessionRegistry<T: ?Sized> {
    sessions: RwLock<HashMap<String, Weak<T>>>,
}

impl<T: ?Sized> SessionRegistry<T> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a transport under `id`.
    ///
    /// Fails with `DuplicateSession` if a live entry already uses the id; the
    /// existing entry is left untouched.
    pub async fn register(&self, id: &str, transport: &Arc<T>) -> RelayResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(id)
            .is_some_and(|existing| existing.strong_count() > 0)
        {
            return Err(RelayError::DuplicateSession(id.to_string()));
        }
        sessions.insert(id.to_string(), Arc::downgrade(transport));
        info!(session_id = %id, active = sessions.len(), "session registered");
        Ok(())
    }

    /// Look up the transport for a session.
    pub async fn lookup(&self, id: &str) -> Option<Arc<T>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).and_then(Weak::upgrade)
    }

    /// Remove a session. Returns whether an entry was present.
    pub async fn deregister(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(id).is_some();
        if removed {
            info!(session_id = %id, active = sessions.len(), "session deregistered");
        }
        removed
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl<T: ?Sized> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}
