//! Stream state tracking for recovery and partial-response preservation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use serde_json::Value;

/// Detected content type of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkContentType {
    Text,
    Json,
}

impl ChunkContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

/// Metadata recorded for every stream chunk.
#[derive(Debug, Clone)]
pub struct ChunkMetadata {
    pub index: usize,
    pub received_at: Instant,
    pub size: usize,
    pub hash: String,
    pub content_type: ChunkContentType,
}

/// Per-request stream state: chunk metadata, the accumulated partial
/// response, and checkpoints for resume.
#[derive(Debug)]
pub struct StreamState {
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub started_at: Instant,
    pub chunks: Vec<ChunkMetadata>,
    pub partial_response: Vec<String>,
    pub total_tokens: u64,
    pub last_checkpoint: Option<usize>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl StreamState {
    pub fn new(request_id: impl Into<String>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            provider: provider.into(),
            model: model.into(),
            started_at: Instant::now(),
            chunks: Vec::new(),
            partial_response: Vec::new(),
            total_tokens: 0,
            last_checkpoint: None,
            error_count: 0,
            last_error: None,
        }
    }

    pub fn record_chunk(&mut self, chunk: &str) {
        let content_type = if serde_json::from_str::<Value>(chunk).is_ok() {
            ChunkContentType::Json
        } else {
            ChunkContentType::Text
        };
        let hash = format!("{:x}", Md5::digest(chunk.as_bytes()));
        self.chunks.push(ChunkMetadata {
            index: self.chunks.len(),
            received_at: Instant::now(),
            size: chunk.len(),
            hash,
            content_type,
        });
        self.partial_response.push(chunk.to_string());
        // Coarse estimate; checkpoint accounting only.
        self.total_tokens += (chunk.len() / 4) as u64;
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.error_count += 1;
        self.last_error = Some(error.into());
    }

    pub fn can_resume(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Position to resume from: last checkpoint if one exists, else the
    /// current chunk count.
    pub fn resume_position(&self) -> usize {
        self.last_checkpoint.unwrap_or(self.chunks.len())
    }

    pub fn create_checkpoint(&mut self) {
        self.last_checkpoint = Some(self.chunks.len());
    }

    pub fn partial_response(&self) -> String {
        self.partial_response.concat()
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Lock-protected map of stream states with TTL-based sweeping.
pub struct StreamStateManager {
    states: Mutex<HashMap<String, StreamState>>,
    ttl: Duration,
}

impl StreamStateManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Create (or replace) the state for a request, sweeping expired states
    /// first.
    pub fn create(&self, request_id: &str, provider: &str, model: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        states.retain(|_, state| state.age() <= ttl);
        states.insert(
            request_id.to_string(),
            StreamState::new(request_id, provider, model),
        );
    }

    pub fn with_state<R>(&self, request_id: &str, f: impl FnOnce(&mut StreamState) -> R) -> Option<R> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get_mut(request_id).map(f)
    }

    pub fn remove(&self, request_id: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(request_id);
    }

    pub fn has_partial_response(&self, request_id: &str) -> bool {
        self.with_state(request_id, |s| s.can_resume()).unwrap_or(false)
    }

    pub fn partial_response(&self, request_id: &str) -> Option<String> {
        self.with_state(request_id, |s| s.partial_response())
            .filter(|s| !s.is_empty())
    }

    pub fn resume_position(&self, request_id: &str) -> Option<usize> {
        self.with_state(request_id, |s| s.resume_position())
    }

    /// Drop states older than the TTL; returns how many were removed.
    pub fn cleanup_old_states(&self) -> usize {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let before = states.len();
        let ttl = self.ttl;
        states.retain(|_, state| state.age() <= ttl);
        before - states.len()
    }

    pub fn active_count(&self) -> usize {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_chunk_tracks_metadata() {
        let mut state = StreamState::new("req", "openai", "gpt-4o-mini");
        state.record_chunk("hello");
        state.record_chunk("{\"a\": 1}");
        assert_eq!(state.chunks.len(), 2);
        assert_eq!(state.chunks[0].index, 0);
        assert_eq!(state.chunks[0].content_type, ChunkContentType::Text);
        assert_eq!(state.chunks[1].content_type, ChunkContentType::Json);
        assert_eq!(state.chunks[0].size, 5);
        assert_eq!(state.chunks[0].hash.len(), 32);
        assert_eq!(state.partial_response(), "hello{\"a\": 1}");
    }

    #[test]
    fn resume_prefers_checkpoint() {
        let mut state = StreamState::new("req", "openai", "m");
        for i in 0..15 {
            state.record_chunk(&format!("c{}", i));
            if state.chunks.len() == 10 {
                state.create_checkpoint();
            }
        }
        assert_eq!(state.resume_position(), 10);
        state.last_checkpoint = None;
        assert_eq!(state.resume_position(), 15);
    }

    #[test]
    fn empty_state_cannot_resume() {
        let state = StreamState::new("req", "openai", "m");
        assert!(!state.can_resume());
        assert_eq!(state.resume_position(), 0);
    }

    #[test]
    fn manager_partial_response_roundtrip() {
        let manager = StreamStateManager::new(Duration::from_secs(900));
        manager.create("req-1", "xai", "grok-3-mini");
        assert!(!manager.has_partial_response("req-1"));
        manager.with_state("req-1", |s| s.record_chunk("partial "));
        manager.with_state("req-1", |s| s.record_chunk("data"));
        assert!(manager.has_partial_response("req-1"));
        assert_eq!(manager.partial_response("req-1").as_deref(), Some("partial data"));
        manager.remove("req-1");
        assert!(!manager.has_partial_response("req-1"));
    }

    #[test]
    fn ttl_sweep_drops_old_states() {
        let manager = StreamStateManager::new(Duration::from_millis(0));
        manager.create("old", "openai", "m");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.cleanup_old_states(), 1);
        assert_eq!(manager.active_count(), 0);
    }
}
