//! Subprocess transport: newline-delimited JSON over the child's stdin/stdout.
//!
//! The child inherits only a small allow-list of environment variables unless
//! the caller supplies its own environment, which then replaces it entirely.
//! Its stderr is passed through to the proxy's stderr.

use mcp_proxy_core::codec::encode_line;
use mcp_proxy_core::{
    BoxFuture, EventChannel, EventReceiver, JsonRpcMessage, LineDecoder, RelayError, RelayResult,
    Transport,
};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Variables inherited by stdio children when no explicit environment is given.
#[cfg(windows)]
pub const DEFAULT_INHERITED_ENV_VARS: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];

/// Variables inherited by stdio children when no explicit environment is given.
#[cfg(not(windows))]
pub const DEFAULT_INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

/// The environment a stdio child gets by default.
///
/// Values starting with `()` are shell function exports and are skipped.
pub fn default_environment() -> BTreeMap<String, String> {
    DEFAULT_INHERITED_ENV_VARS
        .iter()
        .filter_map(|key| {
            let value = std::env::var(key).ok()?;
            if value.starts_with("()") {
                return None;
            }
            Some((key.to_string(), value))
        })
        .collect()
}

/// How to launch the backing server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioParams {
    pub command: String,
    pub args: Vec<String>,
    /// Full environment for the child; `None` means `default_environment()`.
    pub env: Option<HashMap<String, String>>,
}

/// A spawned MCP server speaking JSON lines on stdio.
pub struct StdioTransport {
    params: StdioParams,
    max_message_bytes: usize,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    events: Arc<EventChannel>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Create a transport for `params`. Stdout lines longer than
    /// `max_message_bytes` are reported as errors.
    pub fn new(params: StdioParams, max_message_bytes: usize) -> Self {
        Self {
            params,
            max_message_bytes,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            reader: std::sync::Mutex::new(None),
            events: Arc::new(EventChannel::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    async fn spawn(&self) -> RelayResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RelayError::TransportStart("stdio transport already started".into()));
        }

        let mut cmd = Command::new(&self.params.command);
        cmd.args(&self.params.args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        match &self.params.env {
            Some(env) => {
                cmd.envs(env);
            }
            None => {
                cmd.envs(default_environment());
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            RelayError::TransportStart(format!("failed to spawn {}: {e}", self.params.command))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::TransportStart("child stdout unavailable".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::TransportStart("child stdin unavailable".into()))?;

        info!(
            command = %self.params.command,
            args = ?self.params.args,
            pid = child.id(),
            "spawned stdio server"
        );

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        let handle = tokio::spawn(read_stdout(
            stdout,
            LineDecoder::new(self.max_message_bytes),
            self.events.clone(),
        ));
        if let Ok(mut reader) = self.reader.lock() {
            *reader = Some(handle);
        }
        Ok(())
    }

    async fn write(&self, message: JsonRpcMessage) -> RelayResult<()> {
        let line = encode_line(&message)?;
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .filter(|_| !self.closed.load(Ordering::SeqCst))
            .ok_or_else(|| RelayError::TransportSend("stdio transport not connected".into()))?;
        pipe.write_all(&line)
            .await
            .map_err(|e| RelayError::TransportSend(format!("stdin write failed: {e}")))?;
        pipe.flush()
            .await
            .map_err(|e| RelayError::TransportSend(format!("stdin write failed: {e}")))?;
        Ok(())
    }

    /// Kill the child and release its pipes.
    ///
    /// Never waits on `stdin`: a write blocked on a full pipe holds that lock.
    async fn shutdown(&self) -> RelayResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(handle) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            handle.abort();
        }

        let result = match self.child.lock().await.take() {
            Some(mut child) => match child.kill().await {
                Ok(()) => {
                    debug!(command = %self.params.command, "stdio server terminated");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                Err(e) => Err(RelayError::Io(e)),
            },
            None => Ok(()),
        };

        match self.stdin.try_lock() {
            Ok(mut stdin) => drop(stdin.take()),
            Err(_) => debug!(
                command = %self.params.command,
                "stdin busy, released when the pending write ends"
            ),
        }

        self.events.closed();
        result
    }
}

/// Decode stdout into messages until EOF.
async fn read_stdout(
    mut stdout: ChildStdout,
    mut decoder: LineDecoder,
    events: Arc<EventChannel>,
) {
    let mut buf = vec![0u8; 8192];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for decoded in decoder.feed(&buf[..n]) {
                    match decoded {
                        Ok(message) => events.message(message),
                        Err(e) => events.error(e),
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "stdout read failed");
                events.error(RelayError::Transport(format!("stdout read failed: {e}")));
                break;
            }
        }
    }

    if decoder.pending() > 0 {
        debug!(bytes = decoder.pending(), "discarding unterminated stdout line");
    }
    debug!("stdio server stdout closed");
    events.closed();
}

impl Transport for StdioTransport {
    fn kind(&self) -> &'static str {
        "stdio"
    }

    fn start(&self) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(self.spawn())
    }

    fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(self.write(message))
    }

    fn close(&self) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(self.shutdown())
    }

    fn subscribe(&self) -> Option<EventReceiver> {
        self.events.subscribe()
    }

    fn unsubscribe(&self, events: EventReceiver) {
        self.events.restore(events);
    }
}
