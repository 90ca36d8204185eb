//! xAI chat provider. The wire format is OpenAI-shaped, but streams carry no
//! usage data, so terminal usage is estimated by the aggregator.

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::sync::Arc;

use crate::config::env::api_key_for;
use crate::normalize::params::{TransformedMessages, normalize_params, transform_messages};
use crate::normalize::usage::{Usage, normalize_usage};
use crate::providers::base::{
    GenerationParams, GenerationResponse, Message, Prompt, ProviderAdapter, ProviderError,
    StreamFinal, StreamItem, TextStream, UsageStream,
};
use crate::providers::classify::provider_error_from_transport;
use crate::providers::sse::SseParser;
use crate::providers::{error_from_response, provider_http_client};
use crate::registry::capabilities::capabilities_for;
use crate::registry::models::Provider;
use crate::streaming::adapter::StreamAdapter;
use crate::streaming::manager::EventManager;

const API_BASE: &str = "https://api.x.ai/v1";

pub struct XaiProvider {
    api_key: Option<String>,
    base_url: String,
    client: Client,
    events: Option<Arc<EventManager>>,
}

impl XaiProvider {
    pub fn new() -> Self {
        Self {
            api_key: api_key_for("xai"),
            base_url: API_BASE.to_string(),
            client: provider_http_client(),
            events: None,
        }
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: base_url.into(),
            client: provider_http_client(),
            events: None,
        }
    }

    pub fn with_event_manager(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    fn key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::new("xAI API key not found in environment", "xai")
        })
    }

    fn body(&self, messages: &[Message], params: &GenerationParams) -> Map<String, Value> {
        let caps = capabilities_for(&params.model);
        let mut body = normalize_params(params, Provider::Xai, caps);
        match transform_messages(messages, Provider::Xai, false) {
            TransformedMessages::Standard(wire) => {
                body.insert("messages".into(), Value::Array(wire));
            }
            _ => unreachable!("xai transform"),
        }
        body
    }

    async fn post(&self, body: &Map<String, Value>) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.key()?)
            .json(body)
            .send()
            .await
            .map_err(|e| provider_error_from_transport("xai", &e))?;
        if !resp.status().is_success() {
            return Err(error_from_response("xai", resp).await);
        }
        Ok(resp)
    }

    fn new_adapter(&self, params: &GenerationParams) -> StreamAdapter {
        let mut adapter = StreamAdapter::new(Provider::Xai, params.model.clone());
        adapter.set_response_format(params.response_format.as_ref());
        if let Some(events) = &self.events {
            adapter.set_event_manager(events.clone(), events.request_id.clone());
        }
        adapter
    }
}

impl Default for XaiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for XaiProvider {
    async fn generate(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<GenerationResponse, ProviderError> {
        let messages = prompt.into_messages();
        let body = self.body(&messages, params);
        let resp = self.post(&body).await?;
        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| provider_error_from_transport("xai", &e))?;

        let text = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(GenerationResponse {
            text,
            model: params.model.clone(),
            usage: normalize_usage(parsed.get("usage"), Provider::Xai),
            provider: Provider::Xai,
            finish_reason: parsed
                .pointer("/choices/0/finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            cost_usd: None,
            cost_breakdown: None,
        })
    }

    async fn generate_stream(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<TextStream, ProviderError> {
        let messages = prompt.into_messages();
        let mut body = self.body(&messages, params);
        body.insert("stream".into(), json!(true));
        let resp = self.post(&body).await?;
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
                        let err = provider_error_from_transport("xai", &e);
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
        let mut body = self.body(&messages, params);
        body.insert("stream".into(), json!(true));
        let resp = self.post(&body).await?;
        let mut adapter = self.new_adapter(params);
        // xAI streams never include usage, so the aggregator estimates it.
        adapter.configure_usage_aggregation(&messages, true);
        let model = params.model.clone();

        let stream = try_stream! {
            adapter.start_stream().await;
            let mut parser = SseParser::new();
            let mut bytes = resp.bytes_stream();
            let mut finish_reason: Option<String> = None;

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
                            let delta = adapter.normalize_delta(&data);
                            let piece = delta.as_text().unwrap_or_default().to_string();
                            if !piece.is_empty() {
                                adapter.track_chunk(delta).await;
                                yield StreamItem::Delta(piece);
                            }
                        }
                    }
                    Err(e) => {
                        let err = provider_error_from_transport("xai", &e);
                        adapter.complete_stream(None, Some((&err.message, err.is_retryable))).await;
                        Err::<(), ProviderError>(err)?;
                    }
                }
            }

            let usage = match adapter.aggregated_usage() {
                Some(estimate) => {
                    let mut u = Usage::new(estimate.prompt_tokens, estimate.completion_tokens);
                    u.mark_estimated(estimate.method, estimate.confidence);
                    u
                }
                None => Usage::default(),
            };
            adapter.emit_usage(usage.clone(), true).await;
            let final_json = adapter.final_json();
            adapter.complete_stream(Some(usage.clone()), None).await;
            yield StreamItem::Final(StreamFinal {
                usage,
                model: model.clone(),
                provider: Provider::Xai,
                finish_reason,
                cost_usd: None,
                cost_breakdown: None,
                is_estimated: true,
                final_json,
            });
        };
        Ok(Box::pin(stream))
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn provider(&self) -> Provider {
        Provider::Xai
    }
}
