//! OpenAI provider: Chat Completions plus the Responses API for native
//! JSON-schema outputs.

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::env::{api_key_for, openai_timeout_secs};
use crate::normalize::params::{TransformedMessages, normalize_params, transform_messages};
use crate::normalize::usage::normalize_usage;
use crate::providers::base::{
    GenerationParams, GenerationResponse, Message, Prompt, ProviderAdapter, ProviderError,
    StreamFinal, StreamItem, TextStream, UsageStream,
};
use crate::providers::classify::provider_error_from_transport;
use crate::providers::sse::SseParser;
use crate::providers::{error_from_response, provider_http_client_with_timeout};
use crate::registry::capabilities::capabilities_for;
use crate::registry::models::Provider;
use crate::registry::policy::{
    cache_control_config, format_responses_api_schema, should_use_responses_api,
};
use crate::streaming::adapter::StreamAdapter;
use crate::streaming::manager::EventManager;

const API_BASE: &str = "https://api.openai.com/v1";
const CACHE_THRESHOLD_CHARS: usize = 1024;

pub struct OpenAIProvider {
    api_key: Option<String>,
    base_url: String,
    client: Client,
    events: Option<Arc<EventManager>>,
}

impl OpenAIProvider {
    pub fn new() -> Self {
        Self {
            api_key: api_key_for("openai"),
            base_url: API_BASE.to_string(),
            client: provider_http_client_with_timeout(openai_timeout_secs()),
            events: None,
        }
    }

    /// Point the adapter at a different endpoint (proxies, test servers).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: base_url.into(),
            client: provider_http_client_with_timeout(openai_timeout_secs()),
            events: None,
        }
    }

    pub fn with_event_manager(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    fn key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::new("OpenAI API key not found in environment", "openai")
        })
    }

    fn chat_body(&self, messages: &[Message], params: &GenerationParams) -> Map<String, Value> {
        let caps = capabilities_for(&params.model);
        let mut body = normalize_params(params, Provider::OpenAi, caps);
        // The Responses API field never belongs in a Chat Completions body.
        if let Some(tokens) = body.remove("max_output_tokens") {
            body.insert("max_tokens".into(), tokens);
        }
        body.remove("responses_use_instructions");

        let mut wire: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        // Long system prompts opt into automatic caching where supported.
        if let Some(first) = messages.first() {
            if first.role == crate::providers::base::Role::System {
                if let Some(cc) =
                    cache_control_config(caps, "openai", first.content.len(), CACHE_THRESHOLD_CHARS)
                {
                    wire[0]["cache_control"] = cc;
                }
            }
        }
        body.insert("messages".into(), Value::Array(wire));
        body
    }

    fn responses_body(&self, messages: &[Message], params: &GenerationParams) -> Map<String, Value> {
        let caps = capabilities_for(&params.model);
        let mut body = normalize_params(params, Provider::OpenAi, caps);
        body.remove("response_format");
        body.remove("frequency_penalty");
        body.remove("presence_penalty");
        // normalize_params already chose max_output_tokens for this path.

        let rf = params.response_format.as_ref();
        if let Some(rf) = rf {
            let schema = rf.get("json_schema").or_else(|| rf.get("schema"));
            if let Some(schema) = schema {
                let name = rf.get("name").and_then(Value::as_str).unwrap_or("result");
                let strict = rf.get("strict").and_then(Value::as_bool);
                body.insert(
                    "text".into(),
                    format_responses_api_schema(schema, name, strict),
                );
            }
        }

        let use_instructions = params.metadata_flag("responses_use_instructions");
        body.remove("responses_use_instructions");
        match transform_messages(messages, Provider::OpenAi, use_instructions) {
            TransformedMessages::Instructions {
                instructions,
                input,
            } => {
                body.insert("instructions".into(), json!(instructions));
                body.insert("input".into(), Value::Array(input));
            }
            TransformedMessages::Standard(input) => {
                body.insert("input".into(), Value::Array(input));
            }
            TransformedMessages::SystemSplit { .. } => unreachable!("openai transform"),
        }
        body
    }

    /// Text extraction for Responses API payloads: `output_text`, falling
    /// back to the first output block, then to the serialized body.
    fn extract_responses_text(response: &Value) -> String {
        if let Some(text) = response.get("output_text").and_then(Value::as_str) {
            return text.to_string();
        }
        if let Some(text) = response
            .pointer("/output/0/content/0/text")
            .and_then(Value::as_str)
        {
            return text.to_string();
        }
        response.to_string()
    }

    async fn generate_via_responses(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<GenerationResponse, ProviderError> {
        let body = self.responses_body(messages, params);
        let resp = self
            .client
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(self.key()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| provider_error_from_transport("openai", &e))?;
        if !resp.status().is_success() {
            return Err(error_from_response("openai", resp).await);
        }
        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| provider_error_from_transport("openai", &e))?;

        Ok(GenerationResponse {
            text: Self::extract_responses_text(&parsed),
            model: params.model.clone(),
            usage: normalize_usage(parsed.get("usage"), Provider::OpenAi),
            provider: Provider::OpenAi,
            finish_reason: None,
            cost_usd: None,
            cost_breakdown: None,
        })
    }

    async fn generate_via_chat(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<GenerationResponse, ProviderError> {
        let body = self.chat_body(messages, params);
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.key()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| provider_error_from_transport("openai", &e))?;
        if !resp.status().is_success() {
            return Err(error_from_response("openai", resp).await);
        }
        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| provider_error_from_transport("openai", &e))?;

        let text = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish_reason = parsed
            .pointer("/choices/0/finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(GenerationResponse {
            text,
            model: params.model.clone(),
            usage: normalize_usage(parsed.get("usage"), Provider::OpenAi),
            provider: Provider::OpenAi,
            finish_reason,
            cost_usd: None,
            cost_breakdown: None,
        })
    }

    async fn open_chat_stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
        include_usage: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut body = self.chat_body(messages, params);
        body.insert("stream".into(), json!(true));
        if include_usage {
            body.insert("stream_options".into(), json!({"include_usage": true}));
        }
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.key()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| provider_error_from_transport("openai", &e))?;
        if !resp.status().is_success() {
            return Err(error_from_response("openai", resp).await);
        }
        Ok(resp)
    }

    fn new_adapter(&self, params: &GenerationParams) -> StreamAdapter {
        let mut adapter = StreamAdapter::new(Provider::OpenAi, params.model.clone());
        adapter.set_response_format(params.response_format.as_ref());
        if let Some(events) = &self.events {
            adapter.set_event_manager(events.clone(), events.request_id.clone());
        }
        adapter
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIProvider {
    async fn generate(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<GenerationResponse, ProviderError> {
        let messages = prompt.into_messages();
        let caps = capabilities_for(&params.model);

        if should_use_responses_api(params.response_format.as_ref(), caps) {
            match self.generate_via_responses(&messages, params).await {
                Ok(response) => return Ok(response),
                // The Responses endpoint may be unavailable for this account
                // or model; Chat Completions still honors response_format.
                Err(e) if e.status_code == Some(404) => {
                    debug!("Responses API unavailable, falling back to Chat Completions: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        self.generate_via_chat(&messages, params).await
    }

    async fn generate_stream(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<TextStream, ProviderError> {
        let messages = prompt.into_messages();
        let resp = self.open_chat_stream(&messages, params, false).await?;
        let mut adapter = self.new_adapter(params);

        let stream = try_stream! {
            adapter.start_stream().await;
            let mut parser = SseParser::new();
            let mut bytes = resp.bytes_stream();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        let text = String::from_utf8_lossy(&chunk).into_owned();
                        for event in parser.feed(&text) {
                            let Some(data) = event.data else { continue };
                            let delta = adapter.normalize_delta(&data);
                            let piece = delta.as_text().unwrap_or_default().to_string();
                            if !piece.is_empty() {
                                adapter.track_chunk(delta).await;
                                yield piece;
                            }
                        }
                    }
                    Err(e) => {
                        let err = provider_error_from_transport("openai", &e);
                        adapter.complete_stream(None, Some((&err.message, err.is_retryable))).await;
                        Err::<(), ProviderError>(err)?;
                    }
                }
            }
            adapter.complete_stream(None, None).await;
        };
        Ok(Box::pin(stream))
    }

    async fn generate_stream_with_usage(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<UsageStream, ProviderError> {
        let messages = prompt.into_messages();
        let resp = self.open_chat_stream(&messages, params, true).await?;
        let mut adapter = self.new_adapter(params);
        let model = params.model.clone();

        let stream = try_stream! {
            adapter.start_stream().await;
            let mut parser = SseParser::new();
            let mut bytes = resp.bytes_stream();
            let mut finish_reason: Option<String> = None;
            let mut final_usage: Option<Value> = None;

            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        let text = String::from_utf8_lossy(&chunk).into_owned();
                        for event in parser.feed(&text) {
                            let Some(data) = event.data else { continue };
                            if let Some(reason) = data
                                .pointer("/choices/0/finish_reason")
                                .and_then(Value::as_str)
                            {
                                finish_reason = Some(reason.to_string());
                            }
                            if adapter.should_emit_usage(&data) {
                                final_usage = adapter.extract_usage(&data);
                            }
                            let delta = adapter.normalize_delta(&data);
                            let piece = delta.as_text().unwrap_or_default().to_string();
                            if !piece.is_empty() {
                                adapter.track_chunk(delta).await;
                                yield StreamItem::Delta(piece);
                            }
                        }
                    }
                    Err(e) => {
                        let err = provider_error_from_transport("openai", &e);
                        adapter.complete_stream(None, Some((&err.message, err.is_retryable))).await;
                        Err::<(), ProviderError>(err)?;
                    }
                }
            }

            if final_usage.is_none() {
                warn!("OpenAI stream ended without a usage chunk");
            }
            let usage = normalize_usage(final_usage.as_ref(), Provider::OpenAi);
            adapter.emit_usage(usage.clone(), false).await;
            let final_json = adapter.final_json();
            adapter.complete_stream(Some(usage.clone()), None).await;
            yield StreamItem::Final(StreamFinal {
                usage,
                model: model.clone(),
                provider: Provider::OpenAi,
                finish_reason,
                cost_usd: None,
                cost_breakdown: None,
                is_estimated: false,
                final_json,
            });
        };
        Ok(Box::pin(stream))
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn provider(&self) -> Provider {
        Provider::OpenAi
    }
}
