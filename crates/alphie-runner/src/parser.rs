//! Line-delimited JSON event stream parser.
//!
//! Every non-empty line becomes exactly one [`StreamEvent`]. Lines that fail
//! to parse turn into `error` events so a single bad line never aborts the
//! stream.

use std::sync::Arc;

use alphie_core::{StreamEvent, StreamEventKind};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bounded capacity of a runner's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Longest label kept in a tool summary before it is cut with `…`.
const MAX_LABEL_CHARS: usize = 20;

/// Upper bound on retained stderr; older bytes are dropped first.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Parse one line of runner output. Empty lines yield `None`.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Some(StreamEvent::error(format!("parse error: {e}"), line)),
    };

    let kind = StreamEventKind::from_type(value.get("type").and_then(Value::as_str).unwrap_or(""));
    let mut event = StreamEvent::new(kind.clone(), line);

    match kind {
        StreamEventKind::Error => {
            event.error = value
                .get("error")
                .and_then(text_of)
                .or_else(|| value.get("message").and_then(text_of));
        }
        StreamEventKind::Result => {
            event.message = message_text(&value).or_else(|| value.get("result").and_then(text_of));
        }
        StreamEventKind::System | StreamEventKind::User => {
            event.message = message_text(&value);
        }
        StreamEventKind::Assistant => {
            event.message = message_text(&value);
            event.tool_action = find_tool_use(&value)
                .and_then(|(name, input)| summarize_tool(name, input));
        }
        StreamEventKind::Other(_) => {}
    }

    Some(event)
}

fn message_text(value: &Value) -> Option<String> {
    value
        .get("message")
        .and_then(text_of)
        .or_else(|| value.get("content").and_then(text_of))
}

/// Text carried by a `message`-like value: a plain string, an object with
/// `content` or `text`, or an array of content blocks whose `text` blocks
/// are joined.
fn text_of(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            if let Some(content) = map.get("content") {
                return text_of(content);
            }
            map.get("text").and_then(Value::as_str)?.to_string()
        }
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| match b {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(_) if b.get("type").and_then(Value::as_str) == Some("text") => {
                        b.get("text").and_then(Value::as_str)
                    }
                    _ => None,
                })
                .collect();
            parts.join("\n")
        }
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Locate the first `{name, input}` tool-use pair in an assistant event.
fn find_tool_use(value: &Value) -> Option<(&str, &Value)> {
    let blocks = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .into_iter()
        .chain(value.get("content").and_then(Value::as_array))
        .flatten();

    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("tool_use") {
            if let Some(pair) = tool_pair(block) {
                return Some(pair);
            }
        }
    }

    value.get("tool_use").and_then(tool_pair)
}

fn tool_pair(block: &Value) -> Option<(&str, &Value)> {
    let name = block.get("name").and_then(Value::as_str)?;
    Some((name, block.get("input").unwrap_or(&Value::Null)))
}

/// Short human-readable description of a tool call. Unknown tools yield
/// `None`.
pub fn summarize_tool(name: &str, input: &Value) -> Option<String> {
    let field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| input.get(*k).and_then(Value::as_str))
            .unwrap_or("")
    };

    let summary = match name {
        "Read" => format!("Reading {}", basename(field(&["file_path", "path"]))),
        "Edit" => format!("Editing {}", basename(field(&["file_path", "path"]))),
        "Write" => format!("Writing {}", basename(field(&["file_path", "path"]))),
        "Bash" => format!("Running {}", first_word(field(&["command"]))),
        "Glob" => format!("Finding {}", truncate_label(field(&["pattern"]))),
        "Grep" => format!("Searching {}", truncate_label(field(&["pattern"]))),
        "WebFetch" => "Fetching web page".to_string(),
        "Task" => "Delegating task".to_string(),
        _ => return None,
    };
    Some(summary.trim_end().to_string())
}

fn basename(path: &str) -> String {
    let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
    truncate_label(base)
}

fn first_word(command: &str) -> String {
    truncate_label(command.split_whitespace().next().unwrap_or(""))
}

fn truncate_label(s: &str) -> String {
    if s.chars().count() <= MAX_LABEL_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_LABEL_CHARS - 1).collect();
    out.push('…');
    out
}

/// Read lines from `reader`, parse them, and forward events on `tx` until
/// input is exhausted, the receiver is dropped, or `cancel` fires. Dropping
/// `tx` on return closes the channel.
///
/// Lines are decoded lossily, so invalid UTF-8 reaches [`parse_line`] and
/// becomes an error event. Only an I/O error or EOF ends the stream.
pub async fn pump_events<R>(mut reader: R, tx: mpsc::Sender<StreamEvent>, cancel: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            () = cancel.cancelled() => {
                debug!("event reader cancelled");
                break;
            }
            n = reader.read_until(b'\n', &mut buf) => n,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let Some(event) = parse_line(&line) else {
                    continue;
                };
                trace!(kind = event.kind.as_str(), "runner event");
                let sent = tokio::select! {
                    () = cancel.cancelled() => false,
                    res = tx.send(event) => res.is_ok(),
                };
                if !sent {
                    break;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::error(format!("read error: {e}"), ""))
                    .await;
                break;
            }
        }
    }
}

/// Spawn [`pump_events`] on a fresh bounded channel.
pub fn spawn_event_stream<R>(
    reader: R,
    cancel: CancellationToken,
) -> (mpsc::Receiver<StreamEvent>, tokio::task::JoinHandle<()>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let handle = tokio::spawn(pump_events(reader, tx, cancel));
    (rx, handle)
}

/// Shared, size-capped stderr buffer.
#[derive(Clone, Debug, Default)]
pub struct StderrSink(Arc<Mutex<String>>);

impl StderrSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &str) {
        let mut buf = self.0.lock();
        buf.push_str(chunk);
        if buf.len() > MAX_STDERR_BYTES {
            let mut cut = buf.len() - MAX_STDERR_BYTES;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            let _ = buf.drain(..cut);
        }
    }

    pub fn contents(&self) -> String {
        self.0.lock().clone()
    }

    /// Drain a reader into the sink until EOF.
    pub async fn collect<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => self.append(&String::from_utf8_lossy(&chunk[..n])),
            }
        }
    }
}
