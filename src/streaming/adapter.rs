//! Stream adapter: normalizes provider-specific streaming envelopes.
//!
//! One instance lives for the duration of a single streaming call. It pulls
//! text out of each provider's delta shape, feeds the optional JSON handler
//! and usage aggregator, and emits typed events through the optional event
//! manager and processor.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use super::aggregator::{UsageAggregator, UsageEstimate, create_usage_aggregator};
use super::events::{EventMeta, StreamDelta, StreamEvent};
use super::json_stream::JsonStreamHandler;
use super::manager::EventManager;
use super::processor::EventProcessor;
use crate::normalize::usage::Usage;
use crate::providers::base::Message;
use crate::registry::models::Provider;

/// Streaming throughput metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMetrics {
    pub chunks: u64,
    pub total_chars: u64,
    pub duration_secs: f64,
    pub chunks_per_second: f64,
    pub json_objects_found: usize,
}

pub struct StreamAdapter {
    provider: Provider,
    model: String,
    chunk_count: u64,
    start_time: Option<Instant>,
    total_chars: u64,
    json_handler: Option<JsonStreamHandler>,
    usage_aggregator: Option<Box<dyn UsageAggregator>>,
    events: Option<Arc<EventManager>>,
    processor: Option<EventProcessor>,
    request_id: Option<String>,
    stream_completed: bool,
}

impl StreamAdapter {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            chunk_count: 0,
            start_time: None,
            total_chars: 0,
            json_handler: None,
            usage_aggregator: None,
            events: None,
            processor: None,
            request_id: None,
            stream_completed: false,
        }
    }

    /// Enable the JSON stream handler when the response format asks for a
    /// JSON object or schema output.
    pub fn set_response_format(&mut self, response_format: Option<&Value>) {
        let wants_json = response_format
            .and_then(|rf| rf.get("type"))
            .and_then(Value::as_str)
            .is_some_and(|t| t == "json_object" || t == "json_schema");
        if wants_json {
            self.json_handler = Some(JsonStreamHandler::new());
        }
    }

    /// Configure token estimation for providers without streaming usage.
    pub fn configure_usage_aggregation(&mut self, messages: &[Message], prefer_tiktoken: bool) {
        let mut aggregator = create_usage_aggregator(&self.model, self.provider, prefer_tiktoken);
        aggregator.estimate_prompt_tokens(messages);
        self.usage_aggregator = Some(aggregator);
    }

    pub fn set_event_manager(&mut self, events: Arc<EventManager>, request_id: Option<String>) {
        self.events = Some(events);
        self.request_id = request_id;
    }

    pub fn set_event_processor(&mut self, processor: EventProcessor) {
        self.processor = Some(processor);
    }

    fn meta(&self) -> EventMeta {
        let mut meta = EventMeta::new();
        meta.provider = Some(self.provider.as_str().to_string());
        meta.model = Some(self.model.clone());
        meta.request_id.clone_from(&self.request_id);
        meta
    }

    async fn emit(&mut self, event: StreamEvent) {
        let event = match &mut self.processor {
            Some(processor) => match processor.process(event) {
                Some(event) => event,
                None => return,
            },
            None => event,
        };
        if let Some(events) = &self.events {
            events.emit_enriched(event).await;
        }
    }

    /// Mark stream start and emit the `Start` event.
    pub async fn start_stream(&mut self) {
        self.start_time = Some(Instant::now());
        self.chunk_count = 0;
        self.total_chars = 0;
        let event = StreamEvent::Start {
            meta: self.meta(),
            stream_id: self.request_id.clone(),
        };
        self.emit(event).await;
    }

    /// Normalize a raw provider event into a `StreamDelta`, feeding the JSON
    /// handler and usage aggregator along the way.
    pub fn normalize_delta(&mut self, raw: &Value) -> StreamDelta {
        let text = match self.provider {
            Provider::OpenAi => raw
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Provider::Anthropic => {
                if raw.get("type").and_then(Value::as_str) == Some("content_block_delta") {
                    raw.pointer("/delta/text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                } else {
                    String::new()
                }
            }
            Provider::Xai => raw
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .or_else(|| raw.get("content").and_then(Value::as_str))
                .unwrap_or_default()
                .to_string(),
        };

        if let Some(aggregator) = &mut self.usage_aggregator {
            aggregator.add_completion_chunk(&text);
        }

        if let Some(handler) = &mut self.json_handler {
            if !text.is_empty() {
                if let Some(obj) = handler.process_chunk(&text) {
                    return StreamDelta::Json(obj);
                }
            }
        }

        StreamDelta::Text(text)
    }

    /// Provider-specific: does this raw event carry final usage data?
    pub fn should_emit_usage(&self, raw: &Value) -> bool {
        match self.provider {
            Provider::OpenAi => raw.get("usage").is_some_and(|u| !u.is_null()),
            Provider::Anthropic => matches!(
                raw.get("type").and_then(Value::as_str),
                Some("message_delta" | "message_stop")
            ),
            Provider::Xai => false,
        }
    }

    /// Extract raw usage from a provider event, if present.
    pub fn extract_usage(&self, raw: &Value) -> Option<Value> {
        match self.provider {
            Provider::OpenAi => raw.get("usage").filter(|u| !u.is_null()).cloned(),
            Provider::Anthropic => raw
                .get("usage")
                .or_else(|| raw.pointer("/message/usage"))
                .filter(|u| !u.is_null())
                .cloned(),
            Provider::Xai => None,
        }
    }

    /// Track a chunk and emit its `Delta` event.
    pub async fn track_chunk(&mut self, delta: StreamDelta) {
        let size = delta.as_text().map(str::len).unwrap_or(0);
        let index = self.chunk_count;
        self.chunk_count += 1;
        self.total_chars += size as u64;
        let is_json = delta.is_json();
        let event = StreamEvent::Delta {
            meta: self.meta(),
            delta,
            chunk_index: index,
            is_json,
        };
        self.emit(event).await;
    }

    /// Emit a `Usage` event.
    pub async fn emit_usage(&mut self, usage: Usage, is_estimated: bool) {
        let confidence = if is_estimated {
            self.usage_aggregator
                .as_ref()
                .map_or(0.5, |a| a.confidence())
        } else {
            1.0
        };
        let event = StreamEvent::Usage {
            meta: self.meta(),
            usage,
            is_estimated,
            confidence,
        };
        self.emit(event).await;
    }

    /// Complete the stream with either a `Complete` or an `Error` event.
    /// Idempotent: only the first call emits.
    pub async fn complete_stream(&mut self, final_usage: Option<Usage>, error: Option<(&str, bool)>) {
        if self.stream_completed {
            return;
        }
        self.stream_completed = true;
        let duration_ms = self
            .start_time
            .map_or(0.0, |t| t.elapsed().as_secs_f64() * 1000.0);
        let event = match error {
            Some((message, is_retryable)) => StreamEvent::Error {
                meta: self.meta(),
                error: message.to_string(),
                error_type: "provider_error".to_string(),
                is_retryable,
            },
            None => StreamEvent::Complete {
                meta: self.meta(),
                total_chunks: self.chunk_count,
                duration_ms,
                final_usage,
            },
        };
        self.emit(event).await;
    }

    pub fn is_completed(&self) -> bool {
        self.stream_completed
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Aggregated usage estimate, when aggregation was configured.
    pub fn aggregated_usage(&self) -> Option<UsageEstimate> {
        self.usage_aggregator.as_ref().map(|a| a.usage())
    }

    /// Final parsed JSON object, when the JSON handler was active.
    pub fn final_json(&mut self) -> Option<Value> {
        self.json_handler.as_mut().and_then(JsonStreamHandler::final_object)
    }

    pub fn has_json_handler(&self) -> bool {
        self.json_handler.is_some()
    }

    pub fn metrics(&self) -> StreamMetrics {
        let duration_secs = self.start_time.map_or(0.0, |t| t.elapsed().as_secs_f64());
        StreamMetrics {
            chunks: self.chunk_count,
            total_chars: self.total_chars,
            duration_secs,
            chunks_per_second: if duration_secs > 0.0 {
                self.chunk_count as f64 / duration_secs
            } else {
                0.0
            },
            json_objects_found: self
                .json_handler
                .as_ref()
                .map_or(0, |h| h.all_objects().len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn openai_delta_extraction() {
        let mut adapter = StreamAdapter::new(Provider::OpenAi, "gpt-4o-mini");
        let raw = json!({"choices": [{"delta": {"content": "Hello"}}]});
        let delta = adapter.normalize_delta(&raw);
        assert_eq!(delta.as_text(), Some("Hello"));
    }

    #[test]
    fn anthropic_delta_extraction() {
        let mut adapter = StreamAdapter::new(Provider::Anthropic, "claude-3-haiku-20240307");
        let raw = json!({"type": "content_block_delta", "delta": {"text": "Hi"}});
        assert_eq!(adapter.normalize_delta(&raw).as_text(), Some("Hi"));
        // Non-delta events carry no text.
        let other = json!({"type": "message_start"});
        assert_eq!(adapter.normalize_delta(&other).as_text(), Some(""));
    }

    #[test]
    fn xai_delta_extraction_with_fallback() {
        let mut adapter = StreamAdapter::new(Provider::Xai, "grok-3-mini");
        let wire = json!({"choices": [{"delta": {"content": "a"}}]});
        assert_eq!(adapter.normalize_delta(&wire).as_text(), Some("a"));
        let bare = json!({"content": "b"});
        assert_eq!(adapter.normalize_delta(&bare).as_text(), Some("b"));
    }

    #[test]
    fn openai_usage_detection() {
        let adapter = StreamAdapter::new(Provider::OpenAi, "gpt-4o-mini");
        assert!(adapter.should_emit_usage(&json!({"usage": {"prompt_tokens": 1}})));
        assert!(!adapter.should_emit_usage(&json!({"usage": null})));
        assert!(!adapter.should_emit_usage(&json!({"choices": []})));
    }

    #[test]
    fn anthropic_usage_detection() {
        let adapter = StreamAdapter::new(Provider::Anthropic, "claude-3-haiku-20240307");
        assert!(adapter.should_emit_usage(&json!({"type": "message_delta", "usage": {"output_tokens": 2}})));
        assert!(adapter.should_emit_usage(&json!({"type": "message_stop"})));
        assert!(!adapter.should_emit_usage(&json!({"type": "content_block_delta"})));
    }

    #[test]
    fn xai_never_emits_wire_usage() {
        let adapter = StreamAdapter::new(Provider::Xai, "grok-3-mini");
        assert!(!adapter.should_emit_usage(&json!({"usage": {"prompt_tokens": 1}})));
        assert!(adapter.extract_usage(&json!({"usage": {}})).is_none());
    }

    #[test]
    fn json_handler_replaces_delta_when_object_completes() {
        let mut adapter = StreamAdapter::new(Provider::OpenAi, "gpt-4o-mini");
        adapter.set_response_format(Some(&json!({"type": "json_object"})));
        let part1 = json!({"choices": [{"delta": {"content": "{\"a\":"}}]});
        let part2 = json!({"choices": [{"delta": {"content": " 1}"}}]});
        assert!(!adapter.normalize_delta(&part1).is_json());
        let delta = adapter.normalize_delta(&part2);
        assert!(delta.is_json());
    }

    #[test]
    fn aggregation_tracks_completion_chunks() {
        let mut adapter = StreamAdapter::new(Provider::Xai, "grok-3-mini");
        adapter.configure_usage_aggregation(&[Message::user("hi")], true);
        let raw = json!({"choices": [{"delta": {"content": "Hello world"}}]});
        adapter.normalize_delta(&raw);
        let estimate = adapter.aggregated_usage().unwrap();
        assert!(estimate.completion_tokens > 0);
        assert!(estimate.prompt_tokens > 0);
    }

    #[tokio::test]
    async fn chunk_indices_increase_monotonically() {
        let mut adapter = StreamAdapter::new(Provider::OpenAi, "gpt-4o-mini");
        adapter.start_stream().await;
        adapter.track_chunk(StreamDelta::Text("a".into())).await;
        adapter.track_chunk(StreamDelta::Text("b".into())).await;
        assert_eq!(adapter.chunk_count(), 2);
        let metrics = adapter.metrics();
        assert_eq!(metrics.chunks, 2);
        assert_eq!(metrics.total_chars, 2);
    }

    #[tokio::test]
    async fn complete_stream_is_idempotent() {
        let mut adapter = StreamAdapter::new(Provider::OpenAi, "gpt-4o-mini");
        adapter.start_stream().await;
        adapter.complete_stream(None, None).await;
        assert!(adapter.is_completed());
        // Second completion is a no-op.
        adapter.complete_stream(None, Some(("late error", false))).await;
        assert!(adapter.is_completed());
    }
}
