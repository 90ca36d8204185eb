//! Orchestration event tagging.
//!
//! Wraps an `EventManager` so every event a tool emits carries
//! `source=<tool>` (and `tool_type=bundle` for bundle tools), with an
//! optional redactor applied to metadata before delivery.

use std::sync::Arc;

use serde_json::{Value, json};

use super::options::Redactor;
use crate::streaming::events::{EventMeta, StreamDelta, StreamEvent};
use crate::streaming::manager::EventManager;

#[derive(Clone)]
pub struct OrchestratorEvents {
    base: Arc<EventManager>,
    tool_name: String,
    tool_type: Option<String>,
    redactor: Option<Redactor>,
}

impl OrchestratorEvents {
    pub fn new(base: Arc<EventManager>, tool_name: impl Into<String>) -> Self {
        Self {
            base,
            tool_name: tool_name.into(),
            tool_type: None,
            redactor: None,
        }
    }

    pub fn for_bundle(mut self) -> Self {
        self.tool_type = Some("bundle".to_string());
        self
    }

    pub fn with_redactor(mut self, redactor: Option<Redactor>) -> Self {
        self.redactor = redactor;
        self
    }

    fn tag(&self, meta: &mut EventMeta) {
        meta.metadata
            .insert("source".into(), json!(self.tool_name));
        if let Some(tool_type) = &self.tool_type {
            meta.metadata.insert("tool_type".into(), json!(tool_type));
        }
        if let Some(redactor) = &self.redactor {
            meta.metadata = redactor(std::mem::take(&mut meta.metadata));
        }
    }

    async fn emit(&self, mut event: StreamEvent) {
        self.tag(event.meta_mut());
        self.base.emit_enriched(event).await;
    }

    /// Emit a named tool event (e.g. `bundle_started`, `replicate_done`) as
    /// a JSON delta.
    pub async fn emit_tool_event(&self, event_type: &str, data: Value) {
        self.emit(StreamEvent::Delta {
            meta: EventMeta::new(),
            delta: StreamDelta::Json(json!({"event_type": event_type, "data": data})),
            chunk_index: 0,
            is_json: true,
        })
        .await;
    }

    pub async fn emit_start(&self, request_id: Option<&str>) {
        let mut meta = EventMeta::new();
        meta.request_id = request_id.map(str::to_string);
        self.emit(StreamEvent::Start {
            meta,
            stream_id: request_id.map(str::to_string),
        })
        .await;
    }

    pub async fn emit_complete(&self, total_chunks: u64, duration_ms: f64) {
        self.emit(StreamEvent::Complete {
            meta: EventMeta::new(),
            total_chunks,
            duration_ms,
            final_usage: None,
        })
        .await;
    }

    pub async fn emit_error(&self, error: &str, is_retryable: bool) {
        self.emit(StreamEvent::Error {
            meta: EventMeta::new(),
            error: error.to_string(),
            error_type: "orchestrator_error".to_string(),
            is_retryable,
        })
        .await;
    }
}
