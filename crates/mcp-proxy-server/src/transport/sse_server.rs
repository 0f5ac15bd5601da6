//! Client-facing SSE transport.
//!
//! Outbound messages are written as `message` events on a long-lived SSE
//! response; inbound messages arrive through separate `POST` requests and are
//! handed to `handle_post_message`. The first event on the stream is
//! `endpoint`, telling the browser where to post.

use axum::response::sse::Event;
use futures_util::Stream;
use mcp_proxy_core::{
    generate_session_id, BoxFuture, EventChannel, EventReceiver, JsonRpcMessage, RelayError,
    RelayResult, Transport,
};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Events buffered for a browser that is reading slowly.
const OUTBOUND_BUFFER: usize = 64;

/// One browser session's SSE stream.
pub struct SseServerTransport {
    session_id: String,
    endpoint: String,
    outbound: Mutex<Option<mpsc::Sender<Event>>>,
    pending_stream: Mutex<Option<mpsc::Receiver<Event>>>,
    events: EventChannel,
    started: AtomicBool,
}

impl SseServerTransport {
    /// Create a transport whose clients will post to `endpoint`.
    pub fn new(endpoint: &str) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        Self {
            session_id: generate_session_id(),
            endpoint: endpoint.to_string(),
            outbound: Mutex::new(Some(tx)),
            pending_stream: Mutex::new(Some(rx)),
            events: EventChannel::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// URL announced in the `endpoint` event.
    pub fn endpoint_url(&self) -> String {
        format!("{}?sessionId={}", self.endpoint, self.session_id)
    }

    /// Take the response stream. Dropping it (browser went away) closes the transport.
    pub fn event_stream(self: &Arc<Self>) -> RelayResult<SseStream> {
        let rx = self
            .pending_stream
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| RelayError::Other("SSE stream already taken".into()))?;
        Ok(SseStream {
            rx,
            transport: self.clone(),
        })
    }

    /// Deliver a message posted by the browser.
    ///
    /// A closed transport no longer has a session to deliver to.
    pub fn handle_post_message(&self, message: JsonRpcMessage) -> RelayResult<()> {
        if self.events.is_closed() {
            return Err(RelayError::SessionNotFound(self.session_id.clone()));
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(RelayError::Transport("SSE connection not established".into()));
        }
        self.events.message(message);
        Ok(())
    }

    /// Whether the browser stream has ended.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    fn sender(&self) -> Option<mpsc::Sender<Event>> {
        self.outbound.lock().ok().and_then(|tx| tx.clone())
    }

    fn disconnect(&self) {
        if let Ok(mut tx) = self.outbound.lock() {
            tx.take();
        }
        if self.events.closed() {
            debug!(session_id = %self.session_id, "SSE transport closed");
        }
    }

    async fn announce(&self) -> RelayResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RelayError::TransportStart("SSE transport already started".into()));
        }
        let tx = self
            .sender()
            .ok_or_else(|| RelayError::TransportStart("SSE stream already closed".into()))?;
        tx.send(Event::default().event("endpoint").data(self.endpoint_url()))
            .await
            .map_err(|_| RelayError::TransportStart("SSE stream already closed".into()))
    }

    async fn push(&self, message: JsonRpcMessage) -> RelayResult<()> {
        let tx = self
            .sender()
            .ok_or_else(|| RelayError::TransportSend("SSE stream closed".into()))?;
        let data = serde_json::to_string(&message)?;
        tx.send(Event::default().event("message").data(data))
            .await
            .map_err(|_| RelayError::TransportSend("SSE stream closed".into()))
    }
}

impl Transport for SseServerTransport {
    fn kind(&self) -> &'static str {
        "sse-server"
    }

    fn start(&self) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(self.announce())
    }

    fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(self.push(message))
    }

    fn close(&self) -> BoxFuture<'_, RelayResult<()>> {
        self.disconnect();
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self) -> Option<EventReceiver> {
        self.events.subscribe()
    }

    fn unsubscribe(&self, events: EventReceiver) {
        self.events.restore(events);
    }
}

/// Body stream of the SSE response.
///
/// Ends once the transport is closed and buffered events are flushed.
pub struct SseStream {
    rx: mpsc::Receiver<Event>,
    transport: Arc<SseServerTransport>,
}

impl Stream for SseStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|event| event.map(Ok))
    }
}

impl Drop for SseStream {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}
