//! Event processing pipeline: filters, transformers, and batched background
//! delivery.
//!
//! Nothing in this pipeline may block the stream path: filter/transformer
//! failures are logged and the event dropped, and background submission is
//! non-blocking (full queue drops the event with a warning).

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::events::StreamEvent;

/// Filter deciding whether an event continues down the pipeline.
pub trait EventFilter: Send {
    fn should_process(&self, event: &StreamEvent) -> bool;
}

/// Keep only events of the given kinds (`"start"`, `"delta"`, …).
pub struct TypeFilter {
    allowed: Vec<&'static str>,
}

impl TypeFilter {
    pub fn new(allowed: Vec<&'static str>) -> Self {
        Self { allowed }
    }
}

impl EventFilter for TypeFilter {
    fn should_process(&self, event: &StreamEvent) -> bool {
        self.allowed.contains(&event.kind())
    }
}

/// Keep only events from the given providers.
pub struct ProviderFilter {
    allowed: Vec<String>,
}

impl ProviderFilter {
    pub fn new(allowed: Vec<String>) -> Self {
        Self {
            allowed: allowed.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }
}

impl EventFilter for ProviderFilter {
    fn should_process(&self, event: &StreamEvent) -> bool {
        event
            .meta()
            .provider
            .as_ref()
            .is_some_and(|p| self.allowed.contains(&p.to_lowercase()))
    }
}

/// Custom predicate filter.
pub struct PredicateFilter {
    predicate: Box<dyn Fn(&StreamEvent) -> bool + Send>,
}

impl PredicateFilter {
    pub fn new(predicate: impl Fn(&StreamEvent) -> bool + Send + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
        }
    }
}

impl EventFilter for PredicateFilter {
    fn should_process(&self, event: &StreamEvent) -> bool {
        (self.predicate)(event)
    }
}

/// Transformer applied to surviving events; returning `None` drops the event.
pub trait EventTransformer: Send {
    fn transform(&mut self, event: StreamEvent) -> Option<StreamEvent>;
}

/// Stamps a correlation id into every event's metadata.
pub struct CorrelationTransformer {
    correlation_id: String,
}

impl CorrelationTransformer {
    pub fn new(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id: correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }
}

impl EventTransformer for CorrelationTransformer {
    fn transform(&mut self, mut event: StreamEvent) -> Option<StreamEvent> {
        event.meta_mut().metadata.insert(
            "correlation_id".into(),
            serde_json::json!(self.correlation_id),
        );
        Some(event)
    }
}

/// Stamps wall-clock timestamps (epoch seconds and RFC 3339) into metadata.
pub struct TimestampTransformer;

impl EventTransformer for TimestampTransformer {
    fn transform(&mut self, mut event: StreamEvent) -> Option<StreamEvent> {
        let now = chrono::Utc::now();
        let meta = event.meta_mut();
        meta.metadata.insert(
            "timestamp".into(),
            serde_json::json!(now.timestamp_millis() as f64 / 1000.0),
        );
        meta.metadata
            .insert("datetime".into(), serde_json::json!(now.to_rfc3339()));
        Some(event)
    }
}

/// Tracks time-to-first-token and totals, annotating events as they pass.
#[derive(Default)]
pub struct MetricsTransformer {
    start: Option<Instant>,
    first_token_seen: bool,
    total_chunks: u64,
    errors: u64,
}

impl EventTransformer for MetricsTransformer {
    fn transform(&mut self, mut event: StreamEvent) -> Option<StreamEvent> {
        match &event {
            StreamEvent::Start { .. } => {
                self.start = Some(Instant::now());
            }
            StreamEvent::Delta { .. } => {
                self.total_chunks += 1;
                if !self.first_token_seen {
                    self.first_token_seen = true;
                    if let Some(start) = self.start {
                        event.meta_mut().metadata.insert(
                            "ttft_ms".into(),
                            serde_json::json!(start.elapsed().as_secs_f64() * 1000.0),
                        );
                    }
                    event
                        .meta_mut()
                        .metadata
                        .insert("is_first_token".into(), serde_json::json!(true));
                }
            }
            StreamEvent::Complete { .. } => {
                let meta = event.meta_mut();
                meta.metadata
                    .insert("total_chunks_seen".into(), serde_json::json!(self.total_chunks));
                meta.metadata
                    .insert("errors_seen".into(), serde_json::json!(self.errors));
            }
            StreamEvent::Error { .. } => {
                self.errors += 1;
            }
            StreamEvent::Usage { .. } => {}
        }
        Some(event)
    }
}

/// Synchronous filter + transform pipeline.
#[derive(Default)]
pub struct EventProcessor {
    filters: Vec<Box<dyn EventFilter>>,
    transformers: Vec<Box<dyn EventTransformer>>,
}

impl EventProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: impl EventFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn with_transformer(mut self, transformer: impl EventTransformer + 'static) -> Self {
        self.transformers.push(Box::new(transformer));
        self
    }

    /// Run an event through the pipeline; `None` means filtered out.
    pub fn process(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        if !self.filters.iter().all(|f| f.should_process(&event)) {
            return None;
        }
        let mut current = event;
        for transformer in &mut self.transformers {
            current = transformer.transform(current)?;
        }
        Some(current)
    }
}

pub type BatchSink =
    Box<dyn Fn(Vec<StreamEvent>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Batching configuration for background delivery.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub queue_size: usize,
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            max_batch_size: 32,
            batch_timeout: Duration::from_millis(100),
        }
    }
}

/// Background pipeline: a single consumer task drains a bounded queue,
/// processes events, and delivers them to the sink in batches.
pub struct BackgroundProcessor {
    tx: mpsc::Sender<StreamEvent>,
    handle: JoinHandle<()>,
}

impl BackgroundProcessor {
    pub fn spawn(mut processor: EventProcessor, sink: BatchSink, config: BatchConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(config.queue_size);
        let handle = tokio::spawn(async move {
            let mut batch: Vec<StreamEvent> = Vec::with_capacity(config.max_batch_size);
            loop {
                let recv = tokio::time::timeout(config.batch_timeout, rx.recv()).await;
                match recv {
                    Ok(Some(event)) => {
                        if let Some(processed) = processor.process(event) {
                            batch.push(processed);
                        }
                        if batch.len() >= config.max_batch_size {
                            sink(std::mem::take(&mut batch)).await;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        if !batch.is_empty() {
                            sink(std::mem::take(&mut batch)).await;
                        }
                    }
                }
            }
            // Flush on stop is mandatory.
            if !batch.is_empty() {
                sink(batch).await;
            }
            debug!("background event processor drained");
        });
        Self { tx, handle }
    }

    /// Submit an event without blocking the stream path. A full queue drops
    /// the event.
    pub fn submit(&self, event: StreamEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("event queue full, dropping event: {}", e);
        }
    }

    /// Close the queue and wait for the consumer to flush.
    pub async fn stop(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}
