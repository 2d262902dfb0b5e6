use serde::{Deserialize, Serialize};

/// Discriminant of a runner event, taken from its `type` field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    System,
    Assistant,
    User,
    Result,
    Error,
    /// Any other `type` value, kept verbatim.
    Other(String),
}

impl StreamEventKind {
    pub fn from_type(s: &str) -> Self {
        match s {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            "user" => Self::User,
            "result" => Self::Result,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::Result => "result",
            Self::Error => "error",
            Self::Other(s) => s,
        }
    }
}

/// One parsed line of a runner's event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    pub message: Option<String>,
    pub error: Option<String>,
    /// Short human-readable tool action, e.g. `Reading main.go`.
    pub tool_action: Option<String>,
    /// The original line, kept for token-usage extraction.
    pub raw: String,
}

impl StreamEvent {
    pub fn new(kind: StreamEventKind, raw: impl Into<String>) -> Self {
        Self {
            kind,
            message: None,
            error: None,
            tool_action: None,
            raw: raw.into(),
        }
    }

    pub fn error(error: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(StreamEventKind::Error, raw)
        }
    }

    /// Convenience for tests and synthetic events: an assistant text event
    /// with a matching raw line.
    pub fn assistant_text(text: &str) -> Self {
        let raw = serde_json::json!({"type": "assistant", "message": text}).to_string();
        Self {
            message: Some(text.to_string()),
            ..Self::new(StreamEventKind::Assistant, raw)
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == StreamEventKind::Error
    }

    /// Text a caller would show or accumulate for this event.
    pub fn display_text(&self) -> Option<&str> {
        match self.kind {
            StreamEventKind::Error => self.error.as_deref().or(self.message.as_deref()),
            _ => self.message.as_deref(),
        }
    }
}
