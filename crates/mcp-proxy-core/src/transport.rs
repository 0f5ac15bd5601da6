//! Abstract transport trait for the proxy.
//!
//! The stdio, SSE-client and SSE-server transports all satisfy this trait, so
//! the relay can pair any two of them without knowing which kind it holds.

use crate::error::{RelayError, RelayResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};

/// A JSON-RPC message, relayed opaquely.
pub type JsonRpcMessage = serde_json::Value;

/// Boxed future returned by transport operations (keeps the trait object-safe).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Notification emitted by a transport's receive side.
#[derive(Debug)]
pub enum TransportEvent {
    /// A message arrived from the remote peer.
    Message(JsonRpcMessage),
    /// The receive path failed.
    Error(RelayError),
    /// The channel reached its terminal state. Emitted at most once.
    Closed,
}

/// Ordered stream of events from a single transport.
///
/// Besides the queue, the receiver watches a close flag that is raised the
/// moment the transport closes, ahead of any events still queued.
pub struct EventReceiver {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    closed: watch::Receiver<bool>,
}

impl EventReceiver {
    /// Next queued event. `None` once the transport is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Result<TransportEvent, TryRecvError> {
        self.events.try_recv()
    }

    /// Resolves once the transport has closed, whether or not its queue is drained.
    pub async fn closing(&mut self) {
        // A dropped sender means the transport itself is gone.
        let _ = self.closed.wait_for(|closed| *closed).await;
    }
}

/// A bidirectional message channel.
pub trait Transport: Send + Sync {
    /// Short name of the transport kind, used in logs.
    fn kind(&self) -> &'static str;

    /// Establish the underlying channel and begin receiving.
    fn start(&self) -> BoxFuture<'_, RelayResult<()>>;

    /// Deliver a message to the remote peer.
    fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, RelayResult<()>>;

    /// Close the channel. Closing twice is a no-op.
    fn close(&self) -> BoxFuture<'_, RelayResult<()>>;

    /// Take the event receiver. Only the first caller gets it.
    fn subscribe(&self) -> Option<EventReceiver>;

    /// Hand back a receiver taken by `subscribe` that was never used.
    fn unsubscribe(&self, events: EventReceiver);
}

/// Event plumbing shared by transport implementations.
///
/// Keeps per-transport ordering (one unbounded FIFO), hands the receiver out
/// once, and guarantees a single `Closed` event.
pub struct EventChannel {
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Mutex<Option<EventReceiver>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let (closed_tx, closed) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(Some(EventReceiver { events, closed })),
            closed: AtomicBool::new(false),
            closed_tx,
        }
    }

    /// Hand out the receiver (first call only).
    pub fn subscribe(&self) -> Option<EventReceiver> {
        self.rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Put back a receiver handed out by `subscribe`.
    pub fn restore(&self, events: EventReceiver) {
        if let Ok(mut rx) = self.rx.lock() {
            if rx.is_none() {
                *rx = Some(events);
            }
        }
    }

    /// Queue an inbound message. Dropped after `closed()`.
    pub fn message(&self, message: JsonRpcMessage) {
        if !self.is_closed() {
            let _ = self.tx.send(TransportEvent::Message(message));
        }
    }

    /// Queue a receive-path error. Dropped after `closed()`.
    pub fn error(&self, error: RelayError) {
        if !self.is_closed() {
            let _ = self.tx.send(TransportEvent::Error(error));
        }
    }

    /// Emit `Closed` if it has not been emitted yet. Returns true on the first call.
    pub fn closed(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(TransportEvent::Closed);
        self.closed_tx.send_replace(true);
        true
    }

    /// Whether `Closed` has been emitted.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}
