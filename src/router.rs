//! Router / client: resolves a model id to its provider adapter, normalizes
//! raw parameters, and attaches cost to responses.
//!
//! The router itself does not retry or break circuits; callers that want
//! reliability wrap it (the orchestrator does).

use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::errors::{SteerError, SteerResult};
use crate::normalize::usage::calculate_cost;
use crate::providers::anthropic::AnthropicProvider;
use crate::providers::base::{
    GenerationParams, GenerationResponse, Prompt, ProviderAdapter, StreamItem, TextStream,
    UsageStream,
};
use crate::providers::openai::OpenAIProvider;
use crate::providers::xai::XaiProvider;
use crate::registry::models::{ModelConfig, Provider, is_model_available, model_config, model_configs};
use crate::streaming::manager::EventManager;

/// Availability summary for one model.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub display_name: String,
    pub provider: Provider,
    pub description: String,
    pub available: bool,
    pub input_cost_per_1k_tokens: Option<f64>,
    pub output_cost_per_1k_tokens: Option<f64>,
}

/// High-level client over all configured providers.
pub struct Client {
    openai: OpenAIProvider,
    anthropic: AnthropicProvider,
    xai: XaiProvider,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a raw parameter under either snake_case or camelCase.
fn raw_field<'a>(raw: &'a Map<String, Value>, snake: &str, camel: &str) -> Option<&'a Value> {
    raw.get(snake).or_else(|| raw.get(camel))
}

/// Normalize caller-supplied raw parameters against a model's configuration.
pub fn normalize_raw_params(raw: &Map<String, Value>, config: &ModelConfig) -> GenerationParams {
    let mut params = GenerationParams::new(config.model_id.clone());
    params.max_tokens = raw_field(raw, "max_tokens", "maxTokens")
        .and_then(Value::as_u64)
        .map_or(512, |v| v as u32)
        .min(config.max_tokens);
    params.temperature = raw_field(raw, "temperature", "temperature")
        .and_then(Value::as_f64)
        .unwrap_or(config.temperature);
    params.top_p = raw_field(raw, "top_p", "topP")
        .and_then(Value::as_f64)
        .unwrap_or(1.0);
    params.frequency_penalty = raw_field(raw, "frequency_penalty", "frequencyPenalty")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    params.presence_penalty = raw_field(raw, "presence_penalty", "presencePenalty")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    params.stop = raw.get("stop").and_then(Value::as_array).map(|stops| {
        stops
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    });
    params.response_format = raw_field(raw, "response_format", "responseFormat").cloned();
    params.seed = raw.get("seed").and_then(Value::as_i64);

    let known = [
        "max_tokens",
        "maxTokens",
        "temperature",
        "top_p",
        "topP",
        "frequency_penalty",
        "frequencyPenalty",
        "presence_penalty",
        "presencePenalty",
        "stop",
        "response_format",
        "responseFormat",
        "seed",
    ];
    for (key, value) in raw {
        if !known.contains(&key.as_str()) {
            params.metadata.insert(key.clone(), value.clone());
        }
    }
    params.clamped()
}

impl Client {
    pub fn new() -> Self {
        Self {
            openai: OpenAIProvider::new(),
            anthropic: AnthropicProvider::new(),
            xai: XaiProvider::new(),
        }
    }

    /// Route all providers' streaming events to one manager.
    pub fn with_event_manager(events: Arc<EventManager>) -> Self {
        Self {
            openai: OpenAIProvider::new().with_event_manager(events.clone()),
            anthropic: AnthropicProvider::new().with_event_manager(events.clone()),
            xai: XaiProvider::new().with_event_manager(events),
        }
    }

    /// Replace individual adapters (tests, proxies).
    pub fn with_providers(
        openai: OpenAIProvider,
        anthropic: AnthropicProvider,
        xai: XaiProvider,
    ) -> Self {
        Self {
            openai,
            anthropic,
            xai,
        }
    }

    fn adapter_for(&self, provider: Provider) -> &dyn ProviderAdapter {
        match provider {
            Provider::OpenAi => &self.openai,
            Provider::Anthropic => &self.anthropic,
            Provider::Xai => &self.xai,
        }
    }

    fn resolve(&self, model_id: &str) -> SteerResult<(&'static ModelConfig, &dyn ProviderAdapter)> {
        if !is_model_available(model_id) {
            return Err(SteerError::ModelUnavailable(model_id.to_string()));
        }
        let config = model_config(model_id);
        Ok((config, self.adapter_for(config.provider)))
    }

    /// One-shot generation. Raw params accept both snake_case and camelCase
    /// keys; unknown keys pass through as metadata.
    pub async fn generate(
        &self,
        prompt: impl Into<Prompt>,
        model_id: &str,
        raw_params: &Map<String, Value>,
    ) -> SteerResult<GenerationResponse> {
        let (config, adapter) = self.resolve(model_id)?;
        let params = normalize_raw_params(raw_params, config);
        let mut response = adapter.generate(prompt.into(), &params).await?;
        if config.has_pricing() {
            if let Some((cost, breakdown)) = calculate_cost(&response.usage, config) {
                response.cost_usd = Some(cost);
                response.cost_breakdown = Some(breakdown);
            }
        }
        Ok(response)
    }

    /// Text-only streaming.
    pub async fn stream(
        &self,
        prompt: impl Into<Prompt>,
        model_id: &str,
        raw_params: &Map<String, Value>,
    ) -> SteerResult<TextStream> {
        let (config, adapter) = self.resolve(model_id)?;
        let params = normalize_raw_params(raw_params, config);
        Ok(adapter.generate_stream(prompt.into(), &params).await?)
    }

    /// Streaming with a terminal usage payload; cost is attached to the
    /// final item when the model has pricing.
    pub async fn stream_with_usage(
        &self,
        prompt: impl Into<Prompt>,
        model_id: &str,
        raw_params: &Map<String, Value>,
    ) -> SteerResult<UsageStream> {
        let (config, adapter) = self.resolve(model_id)?;
        let params = normalize_raw_params(raw_params, config);
        let stream = adapter
            .generate_stream_with_usage(prompt.into(), &params)
            .await?;
        let config: &'static ModelConfig = config;
        let stream = stream.map(move |item| {
            item.map(|item| match item {
                StreamItem::Final(mut fin) => {
                    if config.has_pricing() {
                        if let Some((cost, breakdown)) = calculate_cost(&fin.usage, config) {
                            fin.cost_usd = Some(cost);
                            fin.cost_breakdown = Some(breakdown);
                        }
                    }
                    StreamItem::Final(fin)
                }
                delta => delta,
            })
        });
        Ok(Box::pin(stream))
    }

    /// All known models with their availability.
    pub fn get_available_models(&self) -> Vec<ModelInfo> {
        let mut models: Vec<ModelInfo> = model_configs()
            .iter()
            .map(|(name, config)| ModelInfo {
                name: name.clone(),
                display_name: config.display_name.clone(),
                provider: config.provider,
                description: config.description.clone(),
                available: is_model_available(name),
                input_cost_per_1k_tokens: config.input_cost_per_1k_tokens,
                output_cost_per_1k_tokens: config.output_cost_per_1k_tokens,
            })
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    pub fn check_model_availability(&self, model_id: &str) -> bool {
        is_model_available(model_id)
    }

    /// Availability of each provider's credentials.
    pub fn provider_status(&self) -> Vec<(Provider, bool)> {
        vec![
            (Provider::OpenAi, self.openai.is_available()),
            (Provider::Anthropic, self.anthropic.is_available()),
            (Provider::Xai, self.xai.is_available()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn camel_case_keys_accepted() {
        let config = model_config("gpt-4o-mini");
        let params = normalize_raw_params(
            &raw(&[("maxTokens", json!(256)), ("topP", json!(0.5))]),
            config,
        );
        assert_eq!(params.max_tokens, 256);
        assert!((params.top_p - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn max_tokens_clamped_to_model_config() {
        let config = model_config("gpt-4.1-nano");
        let params = normalize_raw_params(&raw(&[("max_tokens", json!(999_999))]), config);
        assert_eq!(params.max_tokens, config.max_tokens);
    }

    #[test]
    fn defaults_come_from_model_config() {
        let config = model_config("gpt-4.1-mini");
        let params = normalize_raw_params(&Map::new(), config);
        assert_eq!(params.max_tokens, 512);
        assert!((params.temperature - config.temperature).abs() < f64::EPSILON);
        assert_eq!(params.model, "gpt-4.1-mini-2025-04-14");
    }

    #[test]
    fn unknown_keys_land_in_metadata() {
        let config = model_config("gpt-4o-mini");
        let params = normalize_raw_params(
            &raw(&[("responses_use_instructions", json!(true))]),
            config,
        );
        assert_eq!(params.metadata["responses_use_instructions"], json!(true));
    }

    #[tokio::test]
    async fn unavailable_model_rejected() {
        // Unknown model ids are never available regardless of env keys.
        let client = Client::new();
        let err = client
            .generate("hi", "no-such-model", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SteerError::ModelUnavailable(_)));
    }
}
