//! Bidirectional relay between a client-facing and a server-facing transport.
//!
//! Each direction runs on its own task and forwards messages verbatim and in
//! order. The first close or error seen on either side terminates the binding:
//! the error (if any) is reported once through the caller's callback, the other
//! transport is closed, and both event subscriptions are dropped.
//!
//! A failed `send` in either direction is treated like a receive error: it is
//! reported and ends the session. A `send` still pending when the binding
//! ends, or when its origin closes, is abandoned.

use crate::error::{RelayError, RelayResult};
use crate::transport::{EventReceiver, Transport, TransportEvent};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Callback receiving every error the relay observes while attached.
pub type ErrorCallback = Arc<dyn Fn(RelayError) + Send + Sync>;

/// Lifecycle of a relay binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Both directions are forwarding.
    Attached,
    /// A close or error was observed; the other side is being closed.
    Closing,
    /// Both sides closed and subscriptions dropped.
    Closed,
}

const ATTACHED: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

impl Side {
    fn peer(self) -> Self {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

enum Cause {
    /// The origin side closed on its own.
    Closed,
    /// The origin side failed to receive, or its peer failed to send.
    Failed(RelayError),
}

struct Binding {
    client: Arc<dyn Transport>,
    server: Arc<dyn Transport>,
    state: AtomicU8,
    on_error: ErrorCallback,
    state_tx: watch::Sender<RelayState>,
}

impl Binding {
    fn transport(&self, side: Side) -> &Arc<dyn Transport> {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    fn is_attached(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ATTACHED
    }

    /// Run the termination sequence. Only the first caller gets past the
    /// state transition; later signals are ignored.
    async fn terminate(&self, origin: Side, cause: Cause) {
        if self
            .state
            .compare_exchange(ATTACHED, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.state_tx.send_replace(RelayState::Closing);

        let origin_closed = match cause {
            Cause::Closed => true,
            Cause::Failed(error) => {
                (self.on_error)(error);
                false
            }
        };

        if let Err(e) = self.transport(origin.peer()).close().await {
            (self.on_error)(e);
        }
        if !origin_closed {
            if let Err(e) = self.transport(origin).close().await {
                (self.on_error)(e);
            }
        }

        self.state.store(CLOSED, Ordering::SeqCst);
        self.state_tx.send_replace(RelayState::Closed);
        debug!(
            client = self.client.kind(),
            server = self.server.kind(),
            "relay closed"
        );
    }
}

/// Handle to a running relay binding.
pub struct RelayHandle {
    binding: Arc<Binding>,
    state_rx: watch::Receiver<RelayState>,
}

impl RelayHandle {
    /// Current state of the binding.
    pub fn state(&self) -> RelayState {
        match self.binding.state.load(Ordering::SeqCst) {
            ATTACHED => RelayState::Attached,
            CLOSING => RelayState::Closing,
            _ => RelayState::Closed,
        }
    }

    /// Wait until the binding reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|state| *state == RelayState::Closed).await;
    }
}

/// Wire `client` and `server` together until either side closes or fails.
///
/// Takes both transports' event subscriptions (`AlreadyBound` if either was
/// already taken) and spawns one forwarding task per direction, so it must be
/// called from within a tokio runtime. Both transports should already be
/// started.
pub fn relay<F>(
    client: Arc<dyn Transport>,
    server: Arc<dyn Transport>,
    on_error: F,
) -> RelayResult<RelayHandle>
where
    F: Fn(RelayError) + Send + Sync + 'static,
{
    let client_events = client.subscribe().ok_or(RelayError::AlreadyBound)?;
    let Some(server_events) = server.subscribe() else {
        client.unsubscribe(client_events);
        return Err(RelayError::AlreadyBound);
    };

    let (state_tx, state_rx) = watch::channel(RelayState::Attached);
    let binding = Arc::new(Binding {
        client,
        server,
        state: AtomicU8::new(ATTACHED),
        on_error: Arc::new(on_error),
        state_tx,
    });

    debug!(
        client = binding.client.kind(),
        server = binding.server.kind(),
        "relay attached"
    );

    tokio::spawn(forward(binding.clone(), Side::Client, client_events));
    tokio::spawn(forward(binding.clone(), Side::Server, server_events));

    Ok(RelayHandle { binding, state_rx })
}

/// Resolves once the binding has left `Attached`.
async fn detached(state: &mut watch::Receiver<RelayState>) {
    let _ = state.wait_for(|s| *s != RelayState::Attached).await;
}

/// What a forwarding task does after one step.
enum Step {
    Continue,
    Stop,
    Terminate(Cause),
}

/// Forward events from `origin` to its peer until the binding leaves `Attached`.
///
/// A pending `send` is abandoned as soon as the binding stops or the origin
/// closes, so a peer that stops reading cannot hold the session open.
async fn forward(binding: Arc<Binding>, origin: Side, mut events: EventReceiver) {
    let mut state = binding.state_tx.subscribe();
    let target = binding.transport(origin.peer()).clone();

    loop {
        let event = tokio::select! {
            biased;
            _ = detached(&mut state) => break,
            event = events.recv() => event,
        };

        let step = match event {
            Some(TransportEvent::Message(message)) => {
                if !binding.is_attached() {
                    break;
                }
                tokio::select! {
                    biased;
                    result = target.send(message) => match result {
                        Ok(()) => Step::Continue,
                        Err(e) => Step::Terminate(Cause::Failed(e)),
                    },
                    _ = detached(&mut state) => Step::Stop,
                    _ = events.closing() => {
                        debug!(
                            origin = binding.transport(origin).kind(),
                            "origin closed while a send was pending"
                        );
                        Step::Terminate(Cause::Closed)
                    }
                }
            }
            Some(TransportEvent::Error(e)) => Step::Terminate(Cause::Failed(e)),
            Some(TransportEvent::Closed) | None => Step::Terminate(Cause::Closed),
        };

        match step {
            Step::Continue => {}
            Step::Stop => break,
            Step::Terminate(cause) => {
                binding.terminate(origin, cause).await;
                break;
            }
        }
    }
    // `events` drops here, detaching this side's subscription.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BoxFuture, EventChannel, JsonRpcMessage};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// In-memory transport recording sends and closes.
    struct MockTransport {
        name: &'static str,
        events: EventChannel,
        sent: Mutex<Vec<JsonRpcMessage>>,
        closed: AtomicBool,
        close_calls: AtomicUsize,
        effective_closes: AtomicUsize,
        fail_sends: AtomicBool,
        send_gate: Option<Arc<Semaphore>>,
    }

    impl MockTransport {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self::build(name, None))
        }

        fn gated(name: &'static str, gate: Arc<Semaphore>) -> Arc<Self> {
            Arc::new(Self::build(name, Some(gate)))
        }

        fn build(name: &'static str, send_gate: Option<Arc<Semaphore>>) -> Self {
            Self {
                name,
                events: EventChannel::new(),
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
                effective_closes: AtomicUsize::new(0),
                fail_sends: AtomicBool::new(false),
                send_gate,
            }
        }

        /// Simulate a message arriving from the remote peer.
        fn receive(&self, message: JsonRpcMessage) {
            self.events.message(message);
        }

        /// Simulate the remote peer going away.
        fn remote_close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.events.closed();
        }

        fn sent(&self) -> Vec<JsonRpcMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        fn kind(&self) -> &'static str {
            self.name
        }

        fn start(&self) -> BoxFuture<'_, RelayResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, RelayResult<()>> {
            Box::pin(async move {
                if let Some(gate) = &self.send_gate {
                    gate.acquire()
                        .await
                        .map_err(|e| RelayError::Other(e.to_string()))?
                        .forget();
                }
                if self.is_closed() {
                    return Err(RelayError::TransportSend(format!("{} closed", self.name)));
                }
                if self.fail_sends.load(Ordering::SeqCst) {
                    return Err(RelayError::TransportSend("simulated send failure".into()));
                }
                self.sent.lock().unwrap().push(message);
                Ok(())
            })
        }

        fn close(&self) -> BoxFuture<'_, RelayResult<()>> {
            Box::pin(async move {
                self.close_calls.fetch_add(1, Ordering::SeqCst);
                if !self.closed.swap(true, Ordering::SeqCst) {
                    self.effective_closes.fetch_add(1, Ordering::SeqCst);
                    self.events.closed();
                }
                Ok(())
            })
        }

        fn subscribe(&self) -> Option<EventReceiver> {
            self.events.subscribe()
        }

        fn unsubscribe(&self, events: EventReceiver) {
            self.events.restore(events);
        }
    }

    type Errors = Arc<Mutex<Vec<RelayError>>>;

    fn bind(client: &Arc<MockTransport>, server: &Arc<MockTransport>) -> (RelayHandle, Errors) {
        let errors: Errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let handle = relay(client.clone(), server.clone(), move |e| {
            sink.lock().unwrap().push(e);
        })
        .unwrap();
        (handle, errors)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_closed(handle: &RelayHandle) {
        tokio::time::timeout(Duration::from_secs(2), handle.closed())
            .await
            .expect("relay did not close in time");
    }

    #[tokio::test]
    async fn forwards_both_directions_in_order() {
        let client = MockTransport::new("client");
        let server = MockTransport::new("server");
        let (handle, errors) = bind(&client, &server);

        let upstream: Vec<_> = (0..20).map(|i| json!({"id": i, "method": "call"})).collect();
        let downstream: Vec<_> = (0..20).map(|i| json!({"id": i, "result": i * 2})).collect();
        for (up, down) in upstream.iter().zip(&downstream) {
            client.receive(up.clone());
            server.receive(down.clone());
        }

        wait_until(|| server.sent().len() == 20 && client.sent().len() == 20).await;
        assert_eq!(server.sent(), upstream);
        assert_eq!(client.sent(), downstream);
        assert_eq!(handle.state(), RelayState::Attached);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_close_after_messages_closes_client() {
        let client = MockTransport::new("client");
        let server = MockTransport::new("server");
        let (handle, errors) = bind(&client, &server);

        client.receive(json!({"type": "ping"}));
        client.receive(json!({"type": "data", "v": 1}));
        wait_until(|| server.sent().len() == 2).await;
        server.remote_close();

        wait_closed(&handle).await;
        assert_eq!(
            server.sent(),
            vec![json!({"type": "ping"}), json!({"type": "data", "v": 1})]
        );
        assert!(client.is_closed());
        assert_eq!(client.effective_closes.load(Ordering::SeqCst), 1);
        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(handle.state(), RelayState::Closed);
    }

    #[tokio::test]
    async fn client_close_closes_server_once() {
        let client = MockTransport::new("client");
        let server = MockTransport::new("server");
        let (handle, errors) = bind(&client, &server);

        client.remote_close();
        wait_closed(&handle).await;

        assert_eq!(server.close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.effective_closes.load(Ordering::SeqCst), 1);
        // The client closed itself; the relay does not close it again.
        assert_eq!(client.close_calls.load(Ordering::SeqCst), 0);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_closes_terminate_once() {
        let client = MockTransport::new("client");
        let server = MockTransport::new("server");
        let (handle, errors) = bind(&client, &server);

        client.remote_close();
        server.remote_close();
        wait_closed(&handle).await;

        assert!(client.is_closed() && server.is_closed());
        let total_calls = client.close_calls.load(Ordering::SeqCst)
            + server.close_calls.load(Ordering::SeqCst);
        assert!(total_calls <= 1, "close called {total_calls} times");
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_failure_reports_once_and_closes_client() {
        let client = MockTransport::new("client");
        let server = MockTransport::new("server");
        server.fail_sends.store(true, Ordering::SeqCst);
        let (handle, errors) = bind(&client, &server);

        client.receive(json!({"id": 1}));
        client.receive(json!({"id": 2}));
        wait_closed(&handle).await;

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], RelayError::TransportSend(_)));
        assert!(client.is_closed());
        assert!(server.is_closed());
        assert!(server.sent().is_empty());
    }

    #[tokio::test]
    async fn reverse_send_failure_reports_once_and_closes_server() {
        let client = MockTransport::new("client");
        let server = MockTransport::new("server");
        client.fail_sends.store(true, Ordering::SeqCst);
        let (handle, errors) = bind(&client, &server);

        server.receive(json!({"id": 1, "result": {}}));
        server.receive(json!({"id": 2, "result": {}}));
        wait_closed(&handle).await;

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], RelayError::TransportSend(_)));
        assert_eq!(server.effective_closes.load(Ordering::SeqCst), 1);
        assert_eq!(client.effective_closes.load(Ordering::SeqCst), 1);
        assert!(client.sent().is_empty());
    }

    #[tokio::test]
    async fn stalled_send_does_not_hold_off_client_close() {
        let gate = Arc::new(Semaphore::new(0));
        let client = MockTransport::new("client");
        let server = MockTransport::gated("server", gate);
        let (handle, errors) = bind(&client, &server);

        // The server never accepts this message.
        client.receive(json!({"id": "stuck"}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.remote_close();

        wait_closed(&handle).await;
        assert!(server.is_closed());
        assert_eq!(server.effective_closes.load(Ordering::SeqCst), 1);
        assert!(server.sent().is_empty());
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stalled_send_is_abandoned_when_other_side_fails() {
        let gate = Arc::new(Semaphore::new(0));
        let client = MockTransport::new("client");
        let server = MockTransport::gated("server", gate.clone());
        let (handle, errors) = bind(&client, &server);

        client.receive(json!({"id": "stuck"}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.events.error(RelayError::Transport("stream reset".into()));

        wait_closed(&handle).await;
        assert!(client.is_closed() && server.is_closed());
        assert_eq!(errors.lock().unwrap().len(), 1);

        // Releasing the gate afterwards must not deliver the abandoned message.
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.sent().is_empty());
    }

    #[tokio::test]
    async fn receive_error_reports_and_closes_both() {
        let client = MockTransport::new("client");
        let server = MockTransport::new("server");
        let (handle, errors) = bind(&client, &server);

        server.events.error(RelayError::Transport("stream reset".into()));
        wait_closed(&handle).await;

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], RelayError::Transport(m) if m == "stream reset"));
        assert_eq!(client.effective_closes.load(Ordering::SeqCst), 1);
        assert_eq!(server.effective_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_sends_after_closed() {
        let client = MockTransport::new("client");
        let server = MockTransport::new("server");
        let (handle, _errors) = bind(&client, &server);

        server.remote_close();
        wait_closed(&handle).await;

        client.receive(json!({"late": true}));
        server.receive(json!({"late": true}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.sent().is_empty());
        assert!(client.sent().is_empty());
    }

    #[tokio::test]
    async fn directions_do_not_block_each_other() {
        let gate = Arc::new(Semaphore::new(0));
        let client = MockTransport::new("client");
        let server = MockTransport::gated("server", gate.clone());
        let (_handle, _errors) = bind(&client, &server);

        // Forward path stalls inside server.send.
        client.receive(json!({"id": "stuck"}));
        server.receive(json!({"id": "reply"}));
        wait_until(|| client.sent().len() == 1).await;
        assert!(server.sent().is_empty());

        gate.add_permits(1);
        wait_until(|| server.sent().len() == 1).await;
        assert_eq!(server.sent(), vec![json!({"id": "stuck"})]);
    }

    #[tokio::test]
    async fn second_binding_is_rejected() {
        let client = MockTransport::new("client");
        let server = MockTransport::new("server");
        let (_handle, _errors) = bind(&client, &server);

        let again = relay(client.clone(), server.clone(), |_| {});
        assert!(matches!(again, Err(RelayError::AlreadyBound)));
    }

    #[tokio::test]
    async fn rejected_binding_leaves_client_bindable() {
        let bound_client = MockTransport::new("bound-client");
        let bound_server = MockTransport::new("bound-server");
        let (_bound, _errors) = bind(&bound_client, &bound_server);

        let client = MockTransport::new("client");
        let rejected = relay(client.clone(), bound_server.clone(), |_| {});
        assert!(matches!(rejected, Err(RelayError::AlreadyBound)));

        let server = MockTransport::new("server");
        let (_handle, _errors) = bind(&client, &server);
        client.receive(json!({"id": 1}));
        wait_until(|| server.sent().len() == 1).await;
    }
}
