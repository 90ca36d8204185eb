//! Event manager: typed callbacks plus request-wide enrichment.

use std::future::Future;
use std::pin::Pin;

use serde_json::json;

use super::events::{EventMeta, StreamEvent};

pub type EventCallback =
    Box<dyn Fn(StreamEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Hook invoked on every created event, after standard enrichment.
pub type CreateEventHook = Box<dyn Fn(&str, &mut EventMeta) + Send + Sync>;

/// Holds optional per-kind callbacks and enriches every event it creates
/// with request id, trace id, SDK version and timestamp.
#[derive(Default)]
pub struct EventManager {
    on_start: Option<EventCallback>,
    on_delta: Option<EventCallback>,
    on_usage: Option<EventCallback>,
    on_complete: Option<EventCallback>,
    on_error: Option<EventCallback>,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub sdk_version: Option<String>,
    on_create_event: Option<CreateEventHook>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, cb: EventCallback) -> Self {
        self.on_start = Some(cb);
        self
    }

    pub fn on_delta(mut self, cb: EventCallback) -> Self {
        self.on_delta = Some(cb);
        self
    }

    pub fn on_usage(mut self, cb: EventCallback) -> Self {
        self.on_usage = Some(cb);
        self
    }

    pub fn on_complete(mut self, cb: EventCallback) -> Self {
        self.on_complete = Some(cb);
        self
    }

    pub fn on_error(mut self, cb: EventCallback) -> Self {
        self.on_error = Some(cb);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_create_event_hook(mut self, hook: CreateEventHook) -> Self {
        self.on_create_event = Some(hook);
        self
    }

    /// Enrich an event's metadata in place.
    pub fn enrich(&self, event: &mut StreamEvent) {
        let kind = event.kind();
        let meta = event.meta_mut();
        if meta.request_id.is_none() {
            meta.request_id.clone_from(&self.request_id);
        }
        let version = self
            .sdk_version
            .clone()
            .unwrap_or_else(|| crate::VERSION.to_string());
        meta.metadata.insert("sdk_version".into(), json!(version));
        if let Some(trace_id) = &self.trace_id {
            meta.metadata
                .entry("trace_id".to_string())
                .or_insert(json!(trace_id));
        }
        if let Some(hook) = &self.on_create_event {
            hook(kind, meta);
        }
    }

    /// Dispatch an event to the matching callback. Emission is sequential;
    /// the callback is awaited before the next event goes out.
    pub async fn emit(&self, event: StreamEvent) {
        let callback = match &event {
            StreamEvent::Start { .. } => &self.on_start,
            StreamEvent::Delta { .. } => &self.on_delta,
            StreamEvent::Usage { .. } => &self.on_usage,
            StreamEvent::Complete { .. } => &self.on_complete,
            StreamEvent::Error { .. } => &self.on_error,
        };
        if let Some(cb) = callback {
            cb(event).await;
        }
    }

    /// Enrich then dispatch.
    pub async fn emit_enriched(&self, mut event: StreamEvent) {
        self.enrich(&mut event);
        self.emit(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_callback(counter: Arc<AtomicU32>) -> EventCallback {
        Box::new(move |_event| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn dispatches_by_event_kind() {
        let deltas = Arc::new(AtomicU32::new(0));
        let manager = EventManager::new().on_delta(counting_callback(deltas.clone()));

        manager
            .emit(StreamEvent::Delta {
                meta: EventMeta::new(),
                delta: super::super::events::StreamDelta::Text("x".into()),
                chunk_index: 0,
                is_json: false,
            })
            .await;
        manager
            .emit(StreamEvent::Start {
                meta: EventMeta::new(),
                stream_id: None,
            })
            .await;

        assert_eq!(deltas.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enrichment_adds_request_and_trace_ids() {
        let manager = EventManager::new()
            .with_request_id("req-1")
            .with_trace_id("trace-1");
        let mut event = StreamEvent::Start {
            meta: EventMeta::new(),
            stream_id: None,
        };
        manager.enrich(&mut event);
        let meta = event.meta();
        assert_eq!(meta.request_id.as_deref(), Some("req-1"));
        assert_eq!(meta.metadata["trace_id"], json!("trace-1"));
        assert_eq!(meta.metadata["sdk_version"], json!(crate::VERSION));
    }

    #[tokio::test]
    async fn create_event_hook_runs_last() {
        let manager = EventManager::new().with_create_event_hook(Box::new(|kind, meta| {
            meta.metadata.insert("kind_seen".into(), json!(kind));
        }));
        let mut event = StreamEvent::Start {
            meta: EventMeta::new(),
            stream_id: None,
        };
        manager.enrich(&mut event);
        assert_eq!(event.meta().metadata["kind_seen"], json!("start"));
    }
}
