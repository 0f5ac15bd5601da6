//! Remote MCP server transport over SSE.
//!
//! `start` opens `GET <url>` as an event stream and waits for the server's
//! `endpoint` event, which names the URL that outbound messages are POSTed to.
//! Every `message` event on the stream is an inbound message.

use futures_util::StreamExt;
use mcp_proxy_core::{
    BoxFuture, EventChannel, EventReceiver, JsonRpcMessage, RelayError, RelayResult, SseDecoder,
    Transport,
};
use reqwest::header::ACCEPT;
use reqwest::Url;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Client side of an MCP SSE connection.
pub struct SseClientTransport {
    url: String,
    http: reqwest::Client,
    startup_timeout: Duration,
    max_message_bytes: usize,
    endpoint: Mutex<Option<Url>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: Arc<EventChannel>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl SseClientTransport {
    /// Create a transport for `url`. Nothing is connected until `start`.
    ///
    /// Events larger than `max_message_bytes` are reported as errors.
    pub fn new(
        url: &str,
        connect_timeout: Duration,
        startup_timeout: Duration,
        max_message_bytes: usize,
    ) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RelayError::TransportStart(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            url: url.to_string(),
            http,
            startup_timeout,
            max_message_bytes,
            endpoint: Mutex::new(None),
            reader: Mutex::new(None),
            events: Arc::new(EventChannel::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// POST endpoint announced by the server, once connected.
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.lock().ok().and_then(|e| e.clone())
    }

    async fn connect(&self) -> RelayResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RelayError::TransportStart("SSE transport already started".into()));
        }

        let url = Url::parse(&self.url)
            .map_err(|e| RelayError::TransportStart(format!("invalid URL {}: {e}", self.url)))?;

        debug!(url = %url, "opening SSE stream");
        let response = self
            .http
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| RelayError::TransportStart(format!("connect to {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(RelayError::TransportStart(format!(
                "{url} returned status {}",
                response.status()
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let handle = tokio::spawn(read_events(
            response,
            url.clone(),
            SseDecoder::new(self.max_message_bytes),
            self.events.clone(),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(self.startup_timeout, endpoint_rx).await {
            Ok(Ok(Ok(endpoint))) => endpoint,
            Ok(Ok(Err(e))) => {
                handle.abort();
                return Err(e);
            }
            Ok(Err(_)) => {
                handle.abort();
                return Err(RelayError::TransportStart(
                    "SSE stream ended before the endpoint event".into(),
                ));
            }
            Err(_) => {
                handle.abort();
                return Err(RelayError::TransportStart(format!(
                    "no endpoint event from {url} within {}s",
                    self.startup_timeout.as_secs()
                )));
            }
        };

        info!(url = %url, endpoint = %endpoint, "connected to SSE server");
        if let Ok(mut slot) = self.endpoint.lock() {
            *slot = Some(endpoint);
        }
        if let Ok(mut reader) = self.reader.lock() {
            *reader = Some(handle);
        }
        Ok(())
    }

    async fn post(&self, message: JsonRpcMessage) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::TransportSend("SSE transport closed".into()));
        }
        let endpoint = self
            .endpoint()
            .ok_or_else(|| RelayError::TransportSend("SSE transport not connected".into()))?;

        let response = self
            .http
            .post(endpoint.clone())
            .json(&message)
            .send()
            .await
            .map_err(|e| RelayError::TransportSend(format!("POST {endpoint} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::TransportSend(format!(
                "POST {endpoint} returned status {status}: {body}"
            )));
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            handle.abort();
        }
        if let Ok(mut endpoint) = self.endpoint.lock() {
            endpoint.take();
        }
        self.events.closed();
        debug!(url = %self.url, "SSE transport closed");
    }
}

/// Resolve the `endpoint` event's data against the stream URL.
///
/// The endpoint must stay on the stream's origin.
fn resolve_endpoint(base: &Url, data: &str) -> RelayResult<Url> {
    let endpoint = base
        .join(data.trim())
        .map_err(|e| RelayError::TransportStart(format!("invalid endpoint {data:?}: {e}")))?;
    if endpoint.origin() != base.origin() {
        return Err(RelayError::TransportStart(format!(
            "endpoint origin does not match connection origin: {endpoint}"
        )));
    }
    Ok(endpoint)
}

/// Decode the event stream until it ends.
async fn read_events(
    response: reqwest::Response,
    base: Url,
    mut decoder: SseDecoder,
    events: Arc<EventChannel>,
    endpoint_tx: oneshot::Sender<RelayResult<Url>>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(url = %base, error = %e, "SSE stream error");
                events.error(RelayError::Transport(format!("SSE stream error: {e}")));
                break;
            }
        };

        for decoded in decoder.feed(&bytes) {
            let event = match decoded {
                Ok(event) => event,
                Err(e) => {
                    match endpoint_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(RelayError::TransportStart(format!(
                                "invalid SSE stream: {e}"
                            ))));
                        }
                        None => events.error(e),
                    }
                    continue;
                }
            };
            match event.event.as_str() {
                "endpoint" => match endpoint_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(resolve_endpoint(&base, &event.data));
                    }
                    None => debug!(data = %event.data, "ignoring repeated endpoint event"),
                },
                "message" => match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                    Ok(message) => events.message(message),
                    Err(e) => events.error(RelayError::InvalidMessage(e.to_string())),
                },
                other => debug!(event = other, "ignoring SSE event"),
            }
        }
    }

    debug!(url = %base, "SSE stream ended");
    events.closed();
}

impl Transport for SseClientTransport {
    fn kind(&self) -> &'static str {
        "sse"
    }

    fn start(&self) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(self.connect())
    }

    fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(self.post(message))
    }

    fn close(&self) -> BoxFuture<'_, RelayResult<()>> {
        self.shutdown();
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self) -> Option<EventReceiver> {
        self.events.subscribe()
    }

    fn unsubscribe(&self, events: EventReceiver) {
        self.events.restore(events);
    }
}
