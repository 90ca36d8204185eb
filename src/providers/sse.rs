//! Incremental Server-Sent Events parsing.
//!
//! Raw `reqwest` byte chunks do not align with SSE event boundaries, so the
//! parser buffers partial lines across `feed` calls and only emits events
//! once their terminating blank line has arrived.

use serde_json::Value;

/// A parsed Server-Sent Event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    /// Parsed JSON payload; `None` for the `[DONE]` sentinel or non-JSON data.
    pub data: Option<Value>,
}

/// Stateful SSE parser. Feed it decoded text chunks; it yields complete
/// events and retains any partial event for the next chunk.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current_event_type: Option<String>,
    current_data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stream text and collect the events it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.finish_event() {
                    events.push(event);
                }
            } else if let Some(event_type) = line.strip_prefix("event:") {
                self.current_event_type = Some(event_type.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.current_data.is_empty() {
                    self.current_data.push('\n');
                }
                self.current_data.push_str(data.trim_start());
            }
            // Comment lines (":keepalive") and unknown fields are ignored.
        }

        events
    }

    /// Flush any event left without a trailing blank line at stream end.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.finish_event()
    }

    fn finish_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event_type = None;
            return None;
        }
        let data = std::mem::take(&mut self.current_data);
        let data = data.trim();
        let parsed = if data == "[DONE]" {
            None
        } else {
            serde_json::from_str::<Value>(data).ok()
        };
        Some(SseEvent {
            event_type: self.current_event_type.take(),
            data: parsed,
        })
    }
}
