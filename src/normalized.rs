//! Normalized event taxonomy and SSE wire framing.
//!
//! Every event a stream driver produces is one of five kinds, tagged with the
//! identity of the target that produced it so a client can demultiplex many
//! concurrently streaming targets over one transport.
//!
//! # Wire format
//!
//! One event per frame:
//!
//! ```text
//! event: <kind>\ndata: <json-payload>\n\n
//! ```
//!
//! | kind         | payload                                               |
//! |--------------|-------------------------------------------------------|
//! | `text`       | `{targetId, text}`                                    |
//! | `latency_ms` | `{targetId, ms}`                                      |
//! | `usage`      | `{targetId, inputTokens, outputTokens, totalTokens}`  |
//! | `error`      | `{targetId, error, errorType}`                        |
//! | `complete`   | `[DONE]`                                              |
//!
//! # Example
//!
//! ```rust
//! use model_relay::normalized::{StreamEvent, sse_event};
//!
//! let event = StreamEvent::text("m1", "Hel");
//! let frame = sse_event(&event);
//! assert_eq!(frame, "event: text\ndata: {\"targetId\":\"m1\",\"text\":\"Hel\"}\n\n");
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Payload of the aggregate `complete` event.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Token accounting for one finished generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Build a usage record whose total is the sum of its parts.
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// `text` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDelta {
    pub target_id: String,
    pub text: String,
}

/// `latency_ms` payload: time from stream start to the first text delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstTokenLatency {
    pub target_id: String,
    pub ms: u64,
}

/// `usage` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetUsage {
    pub target_id: String,
    #[serde(flatten)]
    pub usage: Usage,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetError {
    pub target_id: String,
    pub error: String,
    pub error_type: ErrorKind,
}

/// Discriminant of a [`StreamEvent`], doubling as the SSE `event:` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Text,
    Latency,
    Usage,
    Error,
    Complete,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Latency => "latency_ms",
            Self::Usage => "usage",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "text" => Some(Self::Text),
            "latency_ms" => Some(Self::Latency),
            "usage" => Some(Self::Usage),
            "error" => Some(Self::Error),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// A single event on the multiplexed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(TextDelta),
    Latency(FirstTokenLatency),
    Usage(TargetUsage),
    Error(TargetError),
    /// Aggregate completion; emitted once after every target settled.
    Complete,
}

impl StreamEvent {
    pub fn text(target_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Text(TextDelta {
            target_id: target_id.into(),
            text: text.into(),
        })
    }

    pub fn latency(target_id: impl Into<String>, ms: u64) -> Self {
        Self::Latency(FirstTokenLatency {
            target_id: target_id.into(),
            ms,
        })
    }

    pub fn usage(target_id: impl Into<String>, usage: Usage) -> Self {
        Self::Usage(TargetUsage {
            target_id: target_id.into(),
            usage,
        })
    }

    pub fn error(target_id: impl Into<String>, error: impl Into<String>, kind: ErrorKind) -> Self {
        Self::Error(TargetError {
            target_id: target_id.into(),
            error: error.into(),
            error_type: kind,
        })
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Text(_) => EventKind::Text,
            Self::Latency(_) => EventKind::Latency,
            Self::Usage(_) => EventKind::Usage,
            Self::Error(_) => EventKind::Error,
            Self::Complete => EventKind::Complete,
        }
    }

    /// The target this event belongs to; `None` for the aggregate `complete`.
    #[must_use]
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::Text(p) => Some(&p.target_id),
            Self::Latency(p) => Some(&p.target_id),
            Self::Usage(p) => Some(&p.target_id),
            Self::Error(p) => Some(&p.target_id),
            Self::Complete => None,
        }
    }

    /// Decode an event from its SSE name and data line.
    pub fn decode(name: &str, data: &str) -> Result<Self, DecodeError> {
        let kind = EventKind::parse(name).ok_or_else(|| DecodeError::UnknownKind(name.to_string()))?;
        let event = match kind {
            EventKind::Text => Self::Text(serde_json::from_str(data)?),
            EventKind::Latency => Self::Latency(serde_json::from_str(data)?),
            EventKind::Usage => Self::Usage(serde_json::from_str(data)?),
            EventKind::Error => Self::Error(serde_json::from_str(data)?),
            EventKind::Complete => Self::Complete,
        };
        Ok(event)
    }

    fn data(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Text(p) => serde_json::to_string(p),
            Self::Latency(p) => serde_json::to_string(p),
            Self::Usage(p) => serde_json::to_string(p),
            Self::Error(p) => serde_json::to_string(p),
            Self::Complete => Ok(DONE_SENTINEL.to_string()),
        }
    }
}

/// Failure to decode a frame back into a [`StreamEvent`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown event kind: {0}")]
    UnknownKind(String),
    #[error("malformed event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Get the SSE event name for a [`StreamEvent`].
pub fn event_name(evt: &StreamEvent) -> &'static str {
    evt.kind().as_str()
}

/// Convert a [`StreamEvent`] to one SSE frame.
///
/// The frame is always complete (`event:` line, `data:` line, blank line),
/// so writing it in one call keeps concurrent producers from interleaving
/// partial frames.
pub fn sse_event(evt: &StreamEvent) -> String {
    let json = evt.data().unwrap_or_else(|e| {
        let fallback = TargetError {
            target_id: evt.target_id().unwrap_or_default().to_string(),
            error: e.to_string(),
            error_type: ErrorKind::InternalServerError,
        };
        serde_json::to_string(&fallback).unwrap_or_default()
    });

    format!("event: {}\ndata: {json}\n\n", event_name(evt))
}
