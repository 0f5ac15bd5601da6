//! Session lifecycle management.
//!
//! Establishes a session by starting the backing transport, opening the
//! browser-facing SSE transport, registering it, and binding the relay. The
//! session is deregistered as soon as the relay reports it closed.

use crate::config::ProxyConfig;
use crate::transport::{connect_backing, SseServerTransport, SseStream, TransportParams};
use mcp_proxy_core::{relay, RelayError, RelayResult, SessionRegistry, Transport};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Registry of browser-facing transports, keyed by session id.
pub type ClientRegistry = SessionRegistry<SseServerTransport>;

/// A freshly established session.
pub struct EstablishedSession {
    /// Session identifier announced to the browser.
    pub id: String,
    /// SSE body to return to the browser.
    pub stream: SseStream,
}

/// Creates sessions and routes posted messages to them.
pub struct SessionManager {
    registry: Arc<ClientRegistry>,
    config: Arc<ProxyConfig>,
    message_endpoint: String,
}

impl SessionManager {
    /// Create a manager whose browsers post to `message_endpoint`.
    pub fn new(config: Arc<ProxyConfig>, message_endpoint: &str) -> Self {
        Self {
            registry: Arc::new(ClientRegistry::new()),
            config,
            message_endpoint: message_endpoint.to_string(),
        }
    }

    /// Start the backing transport and pair it with a new browser stream.
    ///
    /// Errors before the relay is bound close the backing transport and leave
    /// nothing registered.
    pub async fn establish(&self, params: TransportParams) -> RelayResult<EstablishedSession> {
        let server = connect_backing(params, &self.config).await?;

        let client = Arc::new(SseServerTransport::new(&self.message_endpoint));
        let id = client.session_id().to_string();

        let stream = match client.event_stream() {
            Ok(stream) => stream,
            Err(e) => return Err(abort(&server, e).await),
        };
        if let Err(e) = client.start().await {
            return Err(abort(&server, e).await);
        }

        if let Err(e) = self.registry.register(&id, &client).await {
            error!(session_id = %id, error = %e, "session id collision");
            return Err(abort(&server, e).await);
        }

        let error_session = id.clone();
        let handle = match relay(client.clone(), server.clone(), move |e| {
            warn!(session_id = %error_session, error = %e, "relay error");
        }) {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.deregister(&id).await;
                return Err(abort(&server, e).await);
            }
        };

        let registry = self.registry.clone();
        let closed_session = id.clone();
        tokio::spawn(async move {
            handle.closed().await;
            registry.deregister(&closed_session).await;
            info!(session_id = %closed_session, "session closed");
        });

        info!(session_id = %id, "session established");
        Ok(EstablishedSession { id, stream })
    }

    /// Find the browser-facing transport of a live session.
    ///
    /// A session whose stream already ended is not live, even if its
    /// deregistration has not run yet.
    pub async fn lookup(&self, session_id: &str) -> RelayResult<Arc<SseServerTransport>> {
        match self.registry.lookup(session_id).await {
            Some(client) if !client.is_closed() => Ok(client),
            Some(_) => {
                self.registry.deregister(session_id).await;
                Err(RelayError::SessionNotFound(session_id.to_string()))
            }
            None => Err(RelayError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Number of live sessions.
    pub async fn active_sessions(&self) -> usize {
        self.registry.len().await
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }
}

/// Close a backing transport that never got bound, passing the original error through.
async fn abort(server: &Arc<dyn Transport>, cause: RelayError) -> RelayError {
    if let Err(e) = server.close().await {
        warn!(error = %e, "failed to close backing transport");
    }
    cause
}
