//! Shared provider types and the adapter contract.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::normalize::usage::{CostBreakdown, Usage};
use crate::providers::classify::ErrorCategory;
use crate::registry::models::Provider;

/// Conversation roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Prompt input accepted by every adapter: a bare string is treated as a
/// single user message.
#[derive(Debug, Clone)]
pub enum Prompt {
    Text(String),
    Messages(Vec<Message>),
}

impl Prompt {
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Prompt::Text(text) => vec![Message::user(text)],
            Prompt::Messages(messages) => messages,
        }
    }

    pub fn to_messages(&self) -> Vec<Message> {
        self.clone().into_messages()
    }
}

impl From<&str> for Prompt {
    fn from(s: &str) -> Self {
        Prompt::Text(s.to_string())
    }
}

impl From<String> for Prompt {
    fn from(s: String) -> Self {
        Prompt::Text(s)
    }
}

impl From<Vec<Message>> for Prompt {
    fn from(messages: Vec<Message>) -> Self {
        Prompt::Messages(messages)
    }
}

pub const MAX_TOKENS_CEILING: u32 = 16_384;

/// Normalized generation parameters shared by all providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub stop: Option<Vec<String>>,
    pub response_format: Option<Value>,
    pub seed: Option<i64>,
    /// Free-form pass-through (e.g. `responses_use_instructions`, `reasoning`).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl GenerationParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 512,
            temperature: 0.7,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop: None,
            response_format: None,
            seed: None,
            metadata: Map::new(),
        }
    }

    /// Clamp values to their legal ranges.
    pub fn clamped(mut self) -> Self {
        self.max_tokens = self.max_tokens.clamp(1, MAX_TOKENS_CEILING);
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.frequency_penalty = self.frequency_penalty.clamp(-2.0, 2.0);
        self.presence_penalty = self.presence_penalty.clamp(-2.0, 2.0);
        self
    }

    /// Metadata flag lookup (`strict`, `responses_use_instructions`, …).
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Normalized response for one-shot generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    pub model: String,
    pub usage: Usage,
    pub provider: Provider,
    pub finish_reason: Option<String>,
    pub cost_usd: Option<f64>,
    pub cost_breakdown: Option<CostBreakdown>,
}

/// Terminal payload of a usage-bearing stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFinal {
    pub usage: Usage,
    pub model: String,
    pub provider: Provider,
    pub finish_reason: Option<String>,
    pub cost_usd: Option<f64>,
    pub cost_breakdown: Option<CostBreakdown>,
    pub is_estimated: bool,
    /// Final parsed object when a JSON stream handler was active.
    pub final_json: Option<Value>,
}

/// Item yielded by usage-bearing streams: text deltas, then exactly one
/// terminal `Final`.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Delta(String),
    Final(StreamFinal),
}

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;
pub type UsageStream = Pin<Box<dyn Stream<Item = Result<StreamItem, ProviderError>> + Send>>;

/// Provider transport/API failure, classified for the reliability layer.
#[derive(Debug, Clone, Error)]
#[error("{provider} API error: {message}")]
pub struct ProviderError {
    pub message: String,
    pub provider: String,
    pub status_code: Option<u16>,
    pub retry_after: Option<f64>,
    pub is_retryable: bool,
    pub error_category: ErrorCategory,
    /// User-facing explanation when the category is recognized.
    pub user_message: Option<String>,
    /// Stringified original error, when this wraps a lower-level failure.
    pub original_error: Option<String>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            provider: provider.into(),
            status_code: None,
            retry_after: None,
            is_retryable: false,
            error_category: ErrorCategory::Unknown,
            user_message: None,
            original_error: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

/// Contract implemented by every provider.
///
/// `params` are expected to already be clamped; adapters additionally cap
/// `max_tokens` to the model's `max_output_tokens`. All transport and API
/// failures surface as `ProviderError`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// One-shot generation.
    async fn generate(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<GenerationResponse, ProviderError>;

    /// Text-only stream.
    async fn generate_stream(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<TextStream, ProviderError>;

    /// Stream of text deltas terminated by a `StreamItem::Final` payload.
    /// Providers whose stream lacks usage estimate it and mark
    /// `is_estimated = true`.
    async fn generate_stream_with_usage(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<UsageStream, ProviderError>;

    /// API key / configuration present.
    fn is_available(&self) -> bool;

    fn provider(&self) -> Provider;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_prompt_becomes_user_message() {
        let prompt: Prompt = "hello".into();
        let messages = prompt.into_messages();
        assert_eq!(messages, vec![Message::user("hello")]);
    }

    #[test]
    fn params_clamp_ranges() {
        let mut params = GenerationParams::new("gpt-4o-mini");
        params.max_tokens = 100_000;
        params.temperature = 5.0;
        params.top_p = 2.0;
        params.frequency_penalty = -9.0;
        let params = params.clamped();
        assert_eq!(params.max_tokens, MAX_TOKENS_CEILING);
        assert_eq!(params.temperature, 2.0);
        assert_eq!(params.top_p, 1.0);
        assert_eq!(params.frequency_penalty, -2.0);
    }

    #[test]
    fn zero_max_tokens_clamps_to_one() {
        let mut params = GenerationParams::new("m");
        params.max_tokens = 0;
        assert_eq!(params.clamped().max_tokens, 1);
    }

    #[test]
    fn provider_error_display() {
        let err = ProviderError::new("boom", "openai").with_status(500);
        assert_eq!(err.to_string(), "openai API error: boom");
        assert_eq!(err.status_code, Some(500));
    }
}
