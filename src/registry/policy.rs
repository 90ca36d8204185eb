//! Capability-driven policy helpers.
//!
//! All decisions that depend on what a model supports flow through these
//! helpers so that providers never hardcode model-name checks.

use serde_json::{Map, Value, json};

use super::capabilities::Capabilities;

/// Wire field used to cap generated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxTokensField {
    MaxTokens,
    MaxCompletionTokens,
    MaxOutputTokens,
}

impl MaxTokensField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxTokens => "max_tokens",
            Self::MaxCompletionTokens => "max_completion_tokens",
            Self::MaxOutputTokens => "max_output_tokens",
        }
    }
}

/// Pick the token-limit field for a model. The Responses API always takes
/// `max_output_tokens` when the model supports it there; reasoning models use
/// `max_completion_tokens`; everything else uses plain `max_tokens`.
pub fn map_max_tokens_field(caps: &Capabilities, use_responses_api: bool) -> MaxTokensField {
    if use_responses_api && caps.uses_max_output_tokens_in_responses_api {
        return MaxTokensField::MaxOutputTokens;
    }
    if caps.uses_max_completion_tokens {
        return MaxTokensField::MaxCompletionTokens;
    }
    MaxTokensField::MaxTokens
}

/// Apply temperature rules to a payload in place: drop it when unsupported,
/// force 1.0 when required, otherwise leave the requested value alone.
pub fn apply_temperature_policy(payload: &mut Map<String, Value>, caps: &Capabilities) {
    if !caps.supports_temperature {
        payload.remove("temperature");
        return;
    }
    if caps.requires_temperature_one {
        payload.insert("temperature".into(), json!(1.0));
    }
}

/// The Responses API is used iff the model supports native JSON schema and
/// the request carries a schema in its response format.
pub fn should_use_responses_api(response_format: Option<&Value>, caps: &Capabilities) -> bool {
    if !caps.supports_json_schema {
        return false;
    }
    match response_format {
        Some(Value::Object(rf)) => rf.contains_key("json_schema") || rf.contains_key("schema"),
        _ => false,
    }
}

/// Format a JSON schema as the Responses API `text` config: the root schema
/// gains `additionalProperties: false` and is wrapped in
/// `{"format": {"type": "json_schema", "name", "schema", "strict"?}}`.
pub fn format_responses_api_schema(schema: &Value, name: &str, strict: Option<bool>) -> Value {
    let mut root = match schema {
        Value::Object(obj) => obj.clone(),
        other => {
            let mut m = Map::new();
            m.insert("schema".into(), other.clone());
            m
        }
    };
    root.entry("additionalProperties".to_string())
        .or_insert(json!(false));

    let mut format = Map::new();
    format.insert("type".into(), json!("json_schema"));
    format.insert("name".into(), json!(name));
    format.insert("schema".into(), Value::Object(root));
    if let Some(strict) = strict {
        format.insert("strict".into(), json!(strict));
    }
    json!({ "format": Value::Object(format) })
}

/// Ephemeral cache-control block for a long message, when the model supports
/// prompt caching and the content crosses the threshold.
pub fn cache_control_config(
    caps: &Capabilities,
    provider: &str,
    message_length: usize,
    threshold: usize,
) -> Option<Value> {
    if !caps.supports_prompt_caching || caps.cache_ttl_seconds.is_none() {
        return None;
    }
    if message_length < threshold {
        return None;
    }
    match provider {
        "openai" | "anthropic" => Some(json!({"type": "ephemeral"})),
        _ => None,
    }
}

/// Settings for deterministic (replicate) runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeterministicSettings {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: Option<i64>,
}

/// Derive deterministic sampling settings from capabilities: temperature is
/// forced to 1.0 where required, otherwise clamped to the deterministic max;
/// seed defaults to 42 when supported.
pub fn deterministic_settings(caps: &Capabilities) -> DeterministicSettings {
    DeterministicSettings {
        temperature: if !caps.supports_temperature {
            None
        } else if caps.requires_temperature_one {
            Some(1.0)
        } else {
            Some(caps.deterministic_temperature_max)
        },
        top_p: Some(caps.deterministic_top_p),
        seed: caps.supports_seed.then_some(42),
    }
}
