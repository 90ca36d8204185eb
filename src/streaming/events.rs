//! Typed streaming events.
//!
//! Every event carries shared metadata (provider, model, request id,
//! timestamp) plus the per-kind payload. Ordering within one stream:
//! `Start` → `Delta`* → optional `Usage` → (`Complete` | `Error`).

use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::normalize::usage::Usage;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Metadata shared by every streaming event.
#[derive(Debug, Clone, Default)]
pub struct EventMeta {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: f64,
    pub metadata: Map<String, Value>,
}

impl EventMeta {
    pub fn new() -> Self {
        Self {
            timestamp: now_secs(),
            ..Self::default()
        }
    }
}

/// A normalized delta pulled out of a provider's stream envelope.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Text(String),
    Json(Value),
}

impl StreamDelta {
    /// Text content, if this delta carries any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StreamDelta::Text(t) => Some(t),
            StreamDelta::Json(v) => v.as_str(),
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, StreamDelta::Json(_))
    }
}

/// Tagged union of streaming events.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start {
        meta: EventMeta,
        stream_id: Option<String>,
    },
    Delta {
        meta: EventMeta,
        delta: StreamDelta,
        chunk_index: u64,
        is_json: bool,
    },
    Usage {
        meta: EventMeta,
        usage: Usage,
        is_estimated: bool,
        confidence: f64,
    },
    Complete {
        meta: EventMeta,
        total_chunks: u64,
        duration_ms: f64,
        final_usage: Option<Usage>,
    },
    Error {
        meta: EventMeta,
        error: String,
        error_type: String,
        is_retryable: bool,
    },
}

impl StreamEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            StreamEvent::Start { meta, .. }
            | StreamEvent::Delta { meta, .. }
            | StreamEvent::Usage { meta, .. }
            | StreamEvent::Complete { meta, .. }
            | StreamEvent::Error { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut EventMeta {
        match self {
            StreamEvent::Start { meta, .. }
            | StreamEvent::Delta { meta, .. }
            | StreamEvent::Usage { meta, .. }
            | StreamEvent::Complete { meta, .. }
            | StreamEvent::Error { meta, .. } => meta,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Delta { .. } => "delta",
            StreamEvent::Usage { .. } => "usage",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_timestamp_populated() {
        let meta = EventMeta::new();
        assert!(meta.timestamp > 0.0);
    }

    #[test]
    fn delta_text_extraction() {
        assert_eq!(StreamDelta::Text("hi".into()).as_text(), Some("hi"));
        assert!(StreamDelta::Json(serde_json::json!({"a": 1})).as_text().is_none());
    }

    #[test]
    fn event_kind_names() {
        let e = StreamEvent::Start {
            meta: EventMeta::new(),
            stream_id: None,
        };
        assert_eq!(e.kind(), "start");
    }
}
