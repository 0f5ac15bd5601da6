//! Stream decoders for the two wire formats the proxy reads.
//!
//! - stdio: newline-delimited JSON, one message per line
//! - SSE: `text/event-stream` events (`event:` / `data:` / `id:` fields)

use crate::error::{RelayError, RelayResult};
use crate::transport::JsonRpcMessage;

/// Serialize a message as a single JSON line (trailing `\n` included).
pub fn encode_line(message: &JsonRpcMessage) -> RelayResult<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Largest single message a decoder buffers unless told otherwise.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

fn oversized(limit: usize) -> RelayError {
    RelayError::InvalidMessage(format!("message exceeds {limit} bytes"))
}

/// Streaming line decoder: accumulates bytes and yields complete JSON messages.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line_bytes: usize,
    /// Dropping the rest of an oversized line.
    discarding: bool,
}

impl LineDecoder {
    /// Create a decoder that rejects lines longer than `max_line_bytes`.
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Feed bytes and return one result per complete line.
    ///
    /// Blank lines are skipped. A line that is not valid JSON, or that grows
    /// past the size limit, yields an `InvalidMessage` error in its position;
    /// decoding continues after it.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<RelayResult<JsonRpcMessage>> {
        let mut messages = Vec::new();

        if self.discarding {
            match data.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    data = &data[pos + 1..];
                    self.discarding = false;
                }
                None => return messages,
            }
        }
        self.buffer.extend_from_slice(data);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > self.max_line_bytes {
                messages.push(Err(oversized(self.max_line_bytes)));
                continue;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            messages.push(serde_json::from_slice(&line).map_err(|e| {
                RelayError::InvalidMessage(format!(
                    "{e}: {}",
                    String::from_utf8_lossy(&line).chars().take(120).collect::<String>()
                ))
            }));
        }

        if self.buffer.len() > self.max_line_bytes {
            messages.push(Err(oversized(self.max_line_bytes)));
            self.buffer.clear();
            self.discarding = true;
        }

        messages
    }

    /// Number of bytes waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

/// A dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type (`message` when the stream did not name one).
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Last event id seen on the stream, if any.
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: String,
    last_id: Option<String>,
    bom_checked: bool,
    max_event_bytes: usize,
    /// Dropping the rest of an oversized line.
    discarding_line: bool,
    /// Dropping lines until the end of an oversized event.
    skipping: bool,
}

impl SseDecoder {
    /// Create a decoder that rejects events larger than `max_event_bytes`.
    pub fn new(max_event_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            event: None,
            data: String::new(),
            last_id: None,
            bom_checked: false,
            max_event_bytes,
            discarding_line: false,
            skipping: false,
        }
    }

    /// Feed bytes and return every event completed by them.
    ///
    /// An event whose pending line or data grows past the size limit is
    /// reported once as `InvalidMessage` and dropped up to its blank line.
    pub fn feed(&mut self, data: &[u8]) -> Vec<RelayResult<SseEvent>> {
        self.buffer.extend_from_slice(data);
        if !self.bom_checked && !self.buffer.is_empty() {
            if self.buffer.starts_with(&[0xEF, 0xBB, 0xBF]) {
                self.buffer.drain(..3);
            }
            self.bom_checked = true;
        }

        let mut events = Vec::new();
        while let Some((end, skip)) = self.next_line_end() {
            let line: Vec<u8> = self.buffer.drain(..end + skip).take(end).collect();
            if self.discarding_line {
                self.discarding_line = false;
                continue;
            }
            if self.skipping {
                if line.is_empty() {
                    self.skipping = false;
                }
                continue;
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(Ok(event));
            }
            if self.data.len() > self.max_event_bytes {
                events.push(Err(oversized(self.max_event_bytes)));
                self.drop_event();
            }
        }

        if self.buffer.len() > self.max_event_bytes {
            if !self.skipping {
                events.push(Err(oversized(self.max_event_bytes)));
            }
            self.buffer.clear();
            self.discarding_line = true;
            self.drop_event();
        }
        events
    }

    /// Forget the event being assembled and skip to its end.
    fn drop_event(&mut self) {
        self.event = None;
        self.data.clear();
        self.skipping = true;
    }

    /// Locate the next line terminator (`\r\n`, `\n` or `\r`).
    ///
    /// A trailing lone `\r` is held back until the next byte shows whether
    /// it starts a `\r\n` pair.
    fn next_line_end(&self) -> Option<(usize, usize)> {
        let pos = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r')?;
        if self.buffer[pos] == b'\n' {
            return Some((pos, 1));
        }
        match self.buffer.get(pos + 1) {
            Some(b'\n') => Some((pos, 2)),
            Some(_) => Some((pos, 1)),
            None => None,
        }
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            // `retry` only matters for reconnecting clients; the proxy never reconnects.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }
        Some(SseEvent {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
            id: self.last_id.clone(),
        })
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}
