//! End-to-end router tests against mock provider endpoints.

use futures_util::StreamExt;
use serde_json::{Map, Value, json};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use steer_sdk::providers::anthropic::AnthropicProvider;
use steer_sdk::providers::base::StreamItem;
use steer_sdk::providers::openai::OpenAIProvider;
use steer_sdk::providers::xai::XaiProvider;
use steer_sdk::router::Client;

fn bypass_availability() {
    // SAFETY: test-only process-wide flag, set before any client is built.
    unsafe {
        std::env::set_var("STEER_SDK_BYPASS_AVAILABILITY_CHECK", "true");
    }
}

async fn client_against(server: &MockServer) -> Client {
    bypass_availability();
    Client::with_providers(
        OpenAIProvider::with_base_url("test_key", server.uri()),
        AnthropicProvider::with_base_url("test_key", server.uri()),
        XaiProvider::with_base_url("test_key", server.uri()),
    )
}

fn raw(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn generate_attaches_cost_from_model_pricing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 1000, "total_tokens": 2000}
        })))
        .mount(&server)
        .await;

    let client = client_against(&server).await;
    let response = client
        .generate("hello", "gpt-4o-mini", &Map::new())
        .await
        .unwrap();

    // 1000 tokens each way at (0.00015, 0.0006) per 1K.
    let cost = response.cost_usd.unwrap();
    assert!((cost - 0.00075).abs() < 1e-9, "cost {}", cost);
    let breakdown = response.cost_breakdown.unwrap();
    assert!((breakdown.input_cost - 0.00015).abs() < 1e-9);
    assert!((breakdown.output_cost - 0.0006).abs() < 1e-9);
}

#[tokio::test]
async fn responses_api_roundtrip_with_schema() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_partial_json(json!({
            "max_output_tokens": 100,
            "text": {"format": {
                "type": "json_schema",
                "name": "r",
                "schema": {"additionalProperties": false}
            }}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output_text": "{\"a\": 3}",
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })))
        .mount(&server)
        .await;

    let client = client_against(&server).await;
    let params = raw(&[
        ("max_tokens", json!(100)),
        (
            "response_format",
            json!({
                "type": "json_schema",
                "name": "r",
                "strict": true,
                "json_schema": {
                    "type": "object",
                    "properties": {"a": {"type": "integer"}},
                    "required": ["a"]
                }
            }),
        ),
    ]);
    let response = client
        .generate("respond JSON only", "gpt-4o-mini", &params)
        .await
        .unwrap();

    let parsed: Value = serde_json::from_str(&response.text).unwrap();
    assert_eq!(parsed["a"], 3);
    assert_eq!(response.usage.prompt_tokens, 10);
    assert_eq!(response.usage.completion_tokens, 5);
    assert_eq!(response.usage.total_tokens, 15);
}

#[tokio::test]
async fn anthropic_streaming_finish_reason_and_usage() {
    let server = MockServer::start().await;
    let events = [
        ("message_start", json!({"type": "message_start", "message": {"usage": {"input_tokens": 5, "output_tokens": 0}}})),
        ("content_block_delta", json!({"type": "content_block_delta", "delta": {"text": "Hi"}})),
        ("content_block_delta", json!({"type": "content_block_delta", "delta": {"text": " there"}})),
        ("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"input_tokens": 5, "output_tokens": 2}})),
        ("message_stop", json!({"type": "message_stop"})),
    ];
    let body: String = events
        .iter()
        .map(|(name, data)| format!("event: {}\ndata: {}\n\n", name, data))
        .collect();
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let client = client_against(&server).await;
    let mut stream = client
        .stream_with_usage("Hi", "claude-3-haiku", &Map::new())
        .await
        .unwrap();

    let mut text = String::new();
    let mut finals = Vec::new();
    while let Some(item) = stream.next().await {
        match item.unwrap() {
            StreamItem::Delta(piece) => text.push_str(&piece),
            StreamItem::Final(fin) => finals.push(fin),
        }
    }
    assert_eq!(text, "Hi there");
    let fin = &finals[0];
    assert_eq!(fin.usage.prompt_tokens, 5);
    assert_eq!(fin.usage.completion_tokens, 2);
    assert_eq!(fin.usage.total_tokens, 7);
    assert_eq!(fin.finish_reason.as_deref(), Some("end_turn"));
    // claude-3-haiku has pricing, so the terminal payload carries cost.
    assert!(fin.cost_usd.is_some());
}

#[tokio::test]
async fn xai_stream_cost_uses_estimated_usage() {
    let server = MockServer::start().await;
    let body = "data: {\"choices\": [{\"delta\": {\"content\": \"Hello\"}}]}\n\n\
                data: {\"choices\": [{\"delta\": {\"content\": \" world\"}}]}\n\n\
                data: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let client = client_against(&server).await;
    let mut stream = client
        .stream_with_usage("Hi", "grok-3-mini", &Map::new())
        .await
        .unwrap();

    let mut finals = Vec::new();
    while let Some(item) = stream.next().await {
        if let StreamItem::Final(fin) = item.unwrap() {
            finals.push(fin);
        }
    }
    let fin = &finals[0];
    assert!(fin.is_estimated);
    assert!(fin.usage.cache_info.contains_key("estimation_method"));
    assert!(fin.usage.cache_info.contains_key("estimation_confidence"));
    assert!(fin.cost_usd.is_some());
}

#[tokio::test]
async fn model_listing_includes_all_providers() {
    bypass_availability();
    let client = Client::new();
    let models = client.get_available_models();
    assert!(models.iter().any(|m| m.name == "gpt-4o-mini"));
    assert!(models.iter().any(|m| m.name == "claude-3-haiku"));
    assert!(models.iter().any(|m| m.name == "grok-3-mini"));
    // Bypass makes every enabled model available.
    assert!(models.iter().all(|m| m.available));
}

#[tokio::test]
async fn provider_errors_surface_through_router() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_json(json!({
                    "error": {"type": "rate_limit_error", "message": "slow down"}
                })),
        )
        .mount(&server)
        .await;

    let client = client_against(&server).await;
    let err = client
        .generate("hi", "gpt-4o-mini", &Map::new())
        .await
        .unwrap_err();
    match err {
        steer_sdk::SteerError::Provider(p) => {
            assert!(p.is_retryable);
            assert_eq!(p.retry_after, Some(7.0));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
