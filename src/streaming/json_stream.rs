//! Incremental JSON extraction from streamed text.
//!
//! Chunks arrive split at arbitrary byte boundaries, possibly with noise
//! between values. The handler scans for balanced objects/arrays (honoring
//! string escapes), parses each complete one, and keeps the unfinished tail
//! buffered. At stream end a conservative bracket-count repair is attempted
//! on whatever is left.

use serde_json::Value;
use tracing::debug;

#[derive(Debug, Default)]
pub struct JsonStreamHandler {
    buffer: String,
    objects: Vec<Value>,
}

impl JsonStreamHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a chunk; returns the most recent complete value when this
    /// chunk finished one or more.
    pub fn process_chunk(&mut self, chunk: &str) -> Option<Value> {
        if chunk.is_empty() {
            return None;
        }
        self.buffer.push_str(chunk);
        let extracted = self.extract_values();
        extracted.into_iter().last()
    }

    /// All complete values found so far.
    pub fn all_objects(&self) -> &[Value] {
        &self.objects
    }

    /// Most recent complete value, or a repair attempt on the remaining
    /// buffer when nothing parsed cleanly.
    pub fn final_object(&mut self) -> Option<Value> {
        if let Some(last) = self.objects.last() {
            return Some(last.clone());
        }
        if self.buffer.trim().is_empty() {
            return None;
        }
        let extracted = self.extract_values();
        if let Some(last) = extracted.into_iter().last() {
            return Some(last);
        }
        repair_json(&self.buffer)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.objects.clear();
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    fn extract_values(&mut self) -> Vec<Value> {
        let bytes: Vec<char> = self.buffer.chars().collect();
        let mut found = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            let c = bytes[i];
            if c.is_whitespace() {
                i += 1;
                continue;
            }
            if c == '{' || c == '[' {
                match find_value_end(&bytes, i) {
                    Some(end) => {
                        let candidate: String = bytes[i..=end].iter().collect();
                        match serde_json::from_str::<Value>(&candidate) {
                            Ok(value) => {
                                self.objects.push(value.clone());
                                found.push(value);
                                i = end + 1;
                            }
                            Err(e) => {
                                debug!("balanced slice failed to parse as JSON: {}", e);
                                i += 1;
                            }
                        }
                    }
                    None => {
                        // Incomplete value: keep the tail buffered.
                        self.buffer = bytes[i..].iter().collect();
                        return found;
                    }
                }
            } else {
                // Noise between values.
                i += 1;
            }
        }

        self.buffer.clear();
        found
    }
}

/// Scan forward from an opening bracket; returns the index of its balanced
/// closer, or `None` while the value is still incomplete.
fn find_value_end(chars: &[char], start: usize) -> Option<usize> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    let open = chars[start];
    if open != '{' && open != '[' {
        return None;
    }
    stack.push(open);

    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if escape_next {
            escape_next = false;
        } else if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
        } else {
            match c {
                '"' => in_string = true,
                '{' | '[' => stack.push(c),
                '}' | ']' => {
                    let expected = match stack.last() {
                        Some('{') => '}',
                        Some('[') => ']',
                        _ => return None,
                    };
                    if c != expected {
                        return None;
                    }
                    stack.pop();
                    if stack.is_empty() {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Conservative repair: append missing closing brackets and retry the parse.
fn repair_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut repaired = trimmed.to_string();
    let open_braces = trimmed.matches('{').count();
    let close_braces = trimmed.matches('}').count();
    let open_brackets = trimmed.matches('[').count();
    let close_brackets = trimmed.matches(']').count();

    if open_braces > close_braces {
        repaired.push_str(&"}".repeat(open_braces - close_braces));
    }
    if open_brackets > close_brackets {
        repaired.push_str(&"]".repeat(open_brackets - close_brackets));
    }
    serde_json::from_str(&repaired).ok()
}
