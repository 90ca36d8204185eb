//! Anthropic Messages API provider.

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::sync::Arc;

use crate::config::env::api_key_for;
use crate::normalize::params::{TransformedMessages, normalize_params, transform_messages};
use crate::normalize::usage::normalize_usage;
use crate::providers::base::{
    GenerationParams, GenerationResponse, Message, Prompt, ProviderAdapter, ProviderError,
    StreamFinal, StreamItem, TextStream, UsageStream,
};
use crate::providers::classify::provider_error_from_transport;
use crate::providers::sse::SseParser;
use crate::providers::{error_from_response, provider_http_client};
use crate::registry::capabilities::capabilities_for;
use crate::registry::models::Provider;
use crate::registry::policy::cache_control_config;
use crate::streaming::adapter::StreamAdapter;
use crate::streaming::manager::EventManager;

const API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const CACHE_THRESHOLD_CHARS: usize = 1024;

pub struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    client: Client,
    events: Option<Arc<EventManager>>,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self {
            api_key: api_key_for("anthropic"),
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
            ProviderError::new("Anthropic API key not found in environment", "anthropic")
        })
    }

    fn body(&self, messages: &[Message], params: &GenerationParams) -> Map<String, Value> {
        let caps = capabilities_for(&params.model);
        let mut body = normalize_params(params, Provider::Anthropic, caps);

        match transform_messages(messages, Provider::Anthropic, false) {
            TransformedMessages::SystemSplit { system, messages } => {
                if let Some(system) = system {
                    // Long system prompts are wrapped with an ephemeral
                    // cache-control block where the model permits.
                    let cache = cache_control_config(
                        caps,
                        "anthropic",
                        system.len(),
                        CACHE_THRESHOLD_CHARS,
                    );
                    let value = match cache {
                        Some(cc) => json!([{"type": "text", "text": system, "cache_control": cc}]),
                        None => json!(system),
                    };
                    body.insert("system".into(), value);
                }
                body.insert("messages".into(), Value::Array(messages));
            }
            _ => unreachable!("anthropic transform"),
        }
        body
    }

    async fn post(&self, body: &Map<String, Value>) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.key()?)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| provider_error_from_transport("anthropic", &e))?;
        if !resp.status().is_success() {
            return Err(error_from_response("anthropic", resp).await);
        }
        Ok(resp)
    }

    fn new_adapter(&self, params: &GenerationParams) -> StreamAdapter {
        let mut adapter = StreamAdapter::new(Provider::Anthropic, params.model.clone());
        adapter.set_response_format(params.response_format.as_ref());
        if let Some(events) = &self.events {
            adapter.set_event_manager(events.clone(), events.request_id.clone());
        }
        adapter
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge usage fields from successive stream events; `message_start` carries
/// input tokens, `message_delta` the running output count.
fn merge_usage(target: &mut Map<String, Value>, raw: &Value) {
    if let Value::Object(fields) = raw {
        for (key, value) in fields {
            if value.as_u64().is_some_and(|v| v > 0) || !target.contains_key(key) {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicProvider {
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
            .map_err(|e| provider_error_from_transport("anthropic", &e))?;

        let mut text = String::new();
        if let Some(blocks) = parsed.get("content").and_then(Value::as_array) {
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
            }
        }

        Ok(GenerationResponse {
            text,
            model: params.model.clone(),
            usage: normalize_usage(parsed.get("usage"), Provider::Anthropic),
            provider: Provider::Anthropic,
            finish_reason: parsed
                .get("stop_reason")
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
                        let err = provider_error_from_transport("anthropic", &e);
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
        let model = params.model.clone();

        let stream = try_stream! {
            adapter.start_stream().await;
            let mut parser = SseParser::new();
            let mut bytes = resp.bytes_stream();
            let mut finish_reason: Option<String> = None;
            let mut usage_fields: Map<String, Value> = Map::new();

            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        let text = String::from_utf8_lossy(&chunk).into_owned();
                        for event in parser.feed(&text) {
                            let Some(data) = event.data else { continue };
                            if let Some(reason) = data
                                .pointer("/delta/stop_reason")
                                .or_else(|| data.get("stop_reason"))
                                .and_then(Value::as_str)
                            {
                                finish_reason = Some(reason.to_string());
                            }
                            if let Some(raw) = adapter.extract_usage(&data) {
                                merge_usage(&mut usage_fields, &raw);
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
                        let err = provider_error_from_transport("anthropic", &e);
                        adapter.complete_stream(None, Some((&err.message, err.is_retryable))).await;
                        Err::<(), ProviderError>(err)?;
                    }
                }
            }

            let usage = normalize_usage(Some(&Value::Object(usage_fields)), Provider::Anthropic);
            adapter.emit_usage(usage.clone(), false).await;
            let final_json = adapter.final_json();
            adapter.complete_stream(Some(usage.clone()), None).await;
            yield StreamItem::Final(StreamFinal {
                usage,
                model: model.clone(),
                provider: Provider::Anthropic,
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
        Provider::Anthropic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params() -> GenerationParams {
        let mut p = GenerationParams::new("claude-3-haiku-20240307");
        p.max_tokens = 256;
        p.clamped()
    }

    #[tokio::test]
    async fn generate_concatenates_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "test_key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [
                    {"type": "text", "text": "Hello"},
                    {"type": "text", "text": " there"}
                ],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 5, "output_tokens": 2}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::with_base_url("test_key", server.uri());
        let result = provider.generate("Hi".into(), &params()).await.unwrap();
        assert_eq!(result.text, "Hello there");
        assert_eq!(result.usage.prompt_tokens, 5);
        assert_eq!(result.usage.total_tokens, 7);
        assert_eq!(result.finish_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn system_messages_concatenate_into_top_level_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_partial_json(json!({"system": "one\n\ntwo"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "ok"}],
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::with_base_url("test_key", server.uri());
        let messages = vec![
            Message::system("one"),
            Message::user("hi"),
            Message::system("two"),
        ];
        let result = provider.generate(messages.into(), &params()).await.unwrap();
        assert_eq!(result.text, "ok");
    }

    #[tokio::test]
    async fn long_system_message_gets_cache_control_block() {
        let server = MockServer::start().await;
        let long_system = "x".repeat(2000);
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_partial_json(json!({
                "system": [{"type": "text", "cache_control": {"type": "ephemeral"}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "ok"}],
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::with_base_url("test_key", server.uri());
        let messages = vec![Message::system(long_system), Message::user("hi")];
        let result = provider.generate(messages.into(), &params()).await.unwrap();
        assert_eq!(result.text, "ok");
    }

    #[tokio::test]
    async fn stop_maps_to_stop_sequences() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_partial_json(json!({"stop_sequences": ["END"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "ok"}],
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::with_base_url("test_key", server.uri());
        let mut p = params();
        p.stop = Some(vec!["END".into()]);
        provider.generate("hi".into(), &p).await.unwrap();
    }

    fn anthropic_sse() -> String {
        let events: Vec<(&str, Value)> = vec![
            (
                "message_start",
                json!({"type": "message_start", "message": {"usage": {"input_tokens": 5, "output_tokens": 0}}}),
            ),
            (
                "content_block_delta",
                json!({"type": "content_block_delta", "delta": {"text": "Hi"}}),
            ),
            (
                "content_block_delta",
                json!({"type": "content_block_delta", "delta": {"text": " there"}}),
            ),
            (
                "message_delta",
                json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"input_tokens": 5, "output_tokens": 2}}),
            ),
            ("message_stop", json!({"type": "message_stop"})),
        ];
        events
            .into_iter()
            .map(|(name, data)| format!("event: {}\ndata: {}\n\n", name, data))
            .collect()
    }

    #[tokio::test]
    async fn streaming_with_usage_reports_message_delta_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(anthropic_sse()),
            )
            .mount(&server)
            .await;

        let provider = AnthropicProvider::with_base_url("test_key", server.uri());
        let mut stream = provider
            .generate_stream_with_usage("Hi".into(), &params())
            .await
            .unwrap();

        let mut text = String::new();
        let mut finals = Vec::new();
        while let Some(item) = stream.next().await {
            match item.unwrap() {
                StreamItem::Delta(piece) => text.push_str(&piece),
                StreamItem::Final(f) => finals.push(f),
            }
        }
        assert_eq!(text, "Hi there");
        assert_eq!(finals.len(), 1);
        let fin = &finals[0];
        assert_eq!(fin.usage.prompt_tokens, 5);
        assert_eq!(fin.usage.completion_tokens, 2);
        assert_eq!(fin.usage.total_tokens, 7);
        assert_eq!(fin.finish_reason.as_deref(), Some("end_turn"));
        assert!(!fin.is_estimated);
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_json(json!({
                "error": {"type": "overloaded_error", "message": "Overloaded"}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::with_base_url("test_key", server.uri());
        let err = provider.generate("hi".into(), &params()).await.unwrap_err();
        assert!(err.is_retryable);
    }
}
