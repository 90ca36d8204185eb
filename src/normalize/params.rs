//! Parameter and message normalization.
//!
//! `normalize_params` turns SDK parameters into a provider payload body,
//! consulting the capability registry instead of hardcoding model names.

use serde_json::{Map, Value, json};

use crate::providers::base::{GenerationParams, Message, Role};
use crate::registry::capabilities::Capabilities;
use crate::registry::models::Provider;
use crate::registry::policy::{
    apply_temperature_policy, deterministic_settings, map_max_tokens_field,
    should_use_responses_api,
};

/// Metadata keys passed through to the provider payload verbatim.
const PASSTHROUGH_KEYS: &[&str] = &["strict", "responses_use_instructions", "reasoning"];

/// Produce the provider payload body for a request.
pub fn normalize_params(
    params: &GenerationParams,
    provider: Provider,
    caps: &Capabilities,
) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("model".into(), json!(params.model));

    let use_responses_api = should_use_responses_api(params.response_format.as_ref(), caps);
    let field = map_max_tokens_field(caps, use_responses_api);
    let max_tokens = params.max_tokens.min(caps.max_output_tokens);
    body.insert(field.as_str().into(), json!(max_tokens));

    body.insert("temperature".into(), json!(params.temperature));
    apply_temperature_policy(&mut body, caps);

    body.insert("top_p".into(), json!(params.top_p));

    if let Some(seed) = params.seed {
        if caps.supports_seed {
            body.insert("seed".into(), json!(seed));
        }
    }

    if let Some(stop) = &params.stop {
        let key = match provider {
            Provider::Anthropic => "stop_sequences",
            _ => "stop",
        };
        body.insert(key.into(), json!(stop));
    }

    if let Some(rf) = &params.response_format {
        if caps.supports_response_format {
            body.insert("response_format".into(), rf.clone());
        }
    }

    match provider {
        Provider::OpenAi => {
            body.insert("frequency_penalty".into(), json!(params.frequency_penalty));
            body.insert("presence_penalty".into(), json!(params.presence_penalty));
            if caps.supports_logprobs {
                if let Some(logprobs) = params.metadata.get("logprobs") {
                    body.insert("logprobs".into(), logprobs.clone());
                }
            }
        }
        Provider::Anthropic => {
            if let Some(top_k) = params.metadata.get("top_k") {
                body.insert("top_k".into(), top_k.clone());
            }
        }
        Provider::Xai => {
            body.insert("frequency_penalty".into(), json!(params.frequency_penalty));
            body.insert("presence_penalty".into(), json!(params.presence_penalty));
        }
    }

    for key in PASSTHROUGH_KEYS {
        if let Some(value) = params.metadata.get(*key) {
            body.insert((*key).to_string(), value.clone());
        }
    }

    body
}

/// Apply deterministic-mode settings to a payload: clamp temperature, pin
/// top-p, and supply a seed where supported.
pub fn apply_deterministic_policy(body: &mut Map<String, Value>, caps: &Capabilities) {
    let settings = deterministic_settings(caps);
    match settings.temperature {
        Some(temp) => {
            let current = body
                .get("temperature")
                .and_then(Value::as_f64)
                .unwrap_or(temp);
            body.insert("temperature".into(), json!(current.min(temp).max(0.0)));
            if caps.requires_temperature_one {
                body.insert("temperature".into(), json!(1.0));
            }
        }
        None => {
            body.remove("temperature");
        }
    }
    if let Some(top_p) = settings.top_p {
        body.insert("top_p".into(), json!(top_p));
    }
    if let Some(seed) = settings.seed {
        body.entry("seed".to_string()).or_insert(json!(seed));
    }
}

/// Provider-specific message layout.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformedMessages {
    /// Role/content list, unchanged.
    Standard(Vec<Value>),
    /// Responses API with the leading system message split into instructions.
    Instructions {
        instructions: String,
        input: Vec<Value>,
    },
    /// Anthropic layout: system messages concatenated into a top-level field.
    SystemSplit {
        system: Option<String>,
        messages: Vec<Value>,
    },
}

fn to_wire(msg: &Message) -> Value {
    json!({"role": msg.role.as_str(), "content": msg.content})
}

/// Transform messages into the layout a provider expects.
pub fn transform_messages(
    messages: &[Message],
    provider: Provider,
    use_instructions: bool,
) -> TransformedMessages {
    match provider {
        Provider::OpenAi => {
            if use_instructions {
                if let Some((first, rest)) = messages.split_first() {
                    if first.role == Role::System {
                        return TransformedMessages::Instructions {
                            instructions: first.content.clone(),
                            input: rest.iter().map(to_wire).collect(),
                        };
                    }
                }
            }
            TransformedMessages::Standard(messages.iter().map(to_wire).collect())
        }
        Provider::Anthropic => {
            let mut system: Option<String> = None;
            let mut rest = Vec::new();
            for msg in messages {
                if msg.role == Role::System {
                    match &mut system {
                        // Multiple system messages concatenate with a blank line.
                        Some(s) => {
                            s.push_str("\n\n");
                            s.push_str(&msg.content);
                        }
                        None => system = Some(msg.content.clone()),
                    }
                } else {
                    rest.push(to_wire(msg));
                }
            }
            TransformedMessages::SystemSplit {
                system,
                messages: rest,
            }
        }
        Provider::Xai => TransformedMessages::Standard(messages.iter().map(to_wire).collect()),
    }
}
