//! Per-model capability records.
//!
//! Capability-driven behavior replaces hardcoded model-name conditionals: the
//! rest of the SDK asks this table what a model supports and derives its
//! decisions from the answer. The table is process-wide and read-only.

use std::collections::HashMap;
use std::sync::LazyLock;

/// Format of streaming deltas emitted by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaFormat {
    Text,
    Json,
    Custom,
}

/// Capabilities supported by a specific model.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub supports_json_schema: bool,
    pub supports_streaming: bool,
    pub supports_tools: bool,
    pub supports_seed: bool,
    pub supports_logprobs: bool,
    pub max_context_length: u32,
    pub max_output_tokens: u32,
    /// Uses `max_completion_tokens` instead of `max_tokens` (reasoning models).
    pub uses_max_completion_tokens: bool,
    /// Uses `max_output_tokens` when going through the Responses API.
    pub uses_max_output_tokens_in_responses_api: bool,
    pub supports_system_message: bool,
    pub supports_response_format: bool,
    pub supports_prompt_caching: bool,
    pub cache_ttl_seconds: Option<u32>,
    pub has_cached_pricing: bool,
    /// Max temperature tolerated in deterministic mode.
    pub deterministic_temperature_max: f64,
    pub deterministic_top_p: f64,
    pub supports_temperature: bool,
    /// Model only accepts temperature=1.0 (o-series reasoning models).
    pub requires_temperature_one: bool,
    pub supports_multiple_system_messages: bool,
    pub supports_image_inputs: bool,
    pub streaming_includes_usage: bool,
    pub streaming_delta_format: DeltaFormat,
}

impl Default for Capabilities {
    /// Conservative defaults for unknown models.
    fn default() -> Self {
        Self {
            supports_json_schema: false,
            supports_streaming: true,
            supports_tools: false,
            supports_seed: false,
            supports_logprobs: false,
            max_context_length: 4096,
            max_output_tokens: 4096,
            uses_max_completion_tokens: false,
            uses_max_output_tokens_in_responses_api: false,
            supports_system_message: true,
            supports_response_format: false,
            supports_prompt_caching: false,
            cache_ttl_seconds: None,
            has_cached_pricing: false,
            deterministic_temperature_max: 0.0,
            deterministic_top_p: 1.0,
            supports_temperature: true,
            requires_temperature_one: false,
            supports_multiple_system_messages: false,
            supports_image_inputs: false,
            streaming_includes_usage: false,
            streaming_delta_format: DeltaFormat::Text,
        }
    }
}

/// Baseline for OpenAI chat models with full feature support.
fn openai_full(max_context_length: u32, max_output_tokens: u32) -> Capabilities {
    Capabilities {
        supports_json_schema: true,
        supports_tools: true,
        supports_seed: true,
        supports_logprobs: true,
        max_context_length,
        max_output_tokens,
        uses_max_output_tokens_in_responses_api: true,
        supports_response_format: true,
        supports_prompt_caching: true,
        cache_ttl_seconds: Some(300),
        has_cached_pricing: true,
        supports_image_inputs: true,
        streaming_includes_usage: true,
        ..Capabilities::default()
    }
}

/// Baseline for Anthropic models: no native JSON schema, usage arrives via
/// `message_delta` rather than a usage-bearing final chunk, multiple system
/// messages are tolerated (the SDK concatenates them).
fn anthropic_base(max_output_tokens: u32) -> Capabilities {
    Capabilities {
        max_context_length: 200_000,
        max_output_tokens,
        supports_prompt_caching: true,
        cache_ttl_seconds: Some(300),
        has_cached_pricing: true,
        supports_multiple_system_messages: true,
        ..Capabilities::default()
    }
}

/// Baseline for xAI models: OpenAI-shaped wire, no streaming usage.
fn xai_base(max_output_tokens: u32) -> Capabilities {
    Capabilities {
        max_context_length: 131_072,
        max_output_tokens,
        ..Capabilities::default()
    }
}

static MODEL_CAPABILITIES: LazyLock<HashMap<&'static str, Capabilities>> = LazyLock::new(|| {
    let mut caps: HashMap<&'static str, Capabilities> = HashMap::new();

    // OpenAI
    caps.insert("gpt-4o-mini", openai_full(128_000, 16_384));
    caps.insert("gpt-4o", openai_full(128_000, 16_384));
    caps.insert("gpt-4.1", openai_full(128_000, 16_384));
    caps.insert("gpt-4.1-mini", openai_full(128_000, 16_384));
    caps.insert(
        "gpt-4.1-nano",
        Capabilities {
            supports_logprobs: false,
            max_context_length: 8192,
            max_output_tokens: 2048,
            supports_prompt_caching: false,
            cache_ttl_seconds: None,
            has_cached_pricing: false,
            supports_image_inputs: false,
            ..openai_full(8192, 2048)
        },
    );
    caps.insert(
        "gpt-3.5-turbo",
        Capabilities {
            supports_tools: true,
            supports_seed: true,
            max_context_length: 16_385,
            max_output_tokens: 4096,
            streaming_includes_usage: true,
            ..Capabilities::default()
        },
    );
    caps.insert(
        "o4-mini",
        Capabilities {
            supports_tools: false,
            supports_seed: false,
            supports_logprobs: false,
            max_output_tokens: 65_536,
            uses_max_completion_tokens: true,
            supports_image_inputs: false,
            deterministic_temperature_max: 1.0,
            requires_temperature_one: true,
            ..openai_full(128_000, 65_536)
        },
    );
    caps.insert(
        "gpt-5",
        Capabilities {
            max_context_length: 512_000,
            max_output_tokens: 65_536,
            cache_ttl_seconds: Some(600),
            deterministic_temperature_max: 0.1,
            ..openai_full(512_000, 65_536)
        },
    );
    caps.insert(
        "gpt-5-mini",
        Capabilities {
            max_context_length: 256_000,
            max_output_tokens: 32_768,
            cache_ttl_seconds: Some(600),
            deterministic_temperature_max: 0.1,
            supports_temperature: false,
            ..openai_full(256_000, 32_768)
        },
    );
    caps.insert(
        "gpt-5-nano",
        Capabilities {
            supports_logprobs: false,
            max_context_length: 16_384,
            max_output_tokens: 4096,
            supports_image_inputs: false,
            ..openai_full(16_384, 4096)
        },
    );

    // Anthropic
    caps.insert("claude-3-haiku-20240307", anthropic_base(4096));
    caps.insert(
        "claude-3-5-sonnet-20241022",
        Capabilities {
            supports_tools: true,
            supports_image_inputs: true,
            ..anthropic_base(8192)
        },
    );
    caps.insert(
        "claude-3-opus-20240229",
        Capabilities {
            supports_tools: true,
            supports_image_inputs: true,
            ..anthropic_base(4096)
        },
    );
    caps.insert("claude-3-5-haiku-20241022", anthropic_base(8192));

    // xAI
    caps.insert("grok-beta", xai_base(4096));
    caps.insert("grok-2-1212", xai_base(4096));
    caps.insert("grok-3-mini", xai_base(8192));

    caps
});

/// Versioned model ids fold to their base entry. Exact match only — an
/// unlisted versioned id falls back to the conservative default rather than
/// prefix-matching, so collisions cannot occur.
static MODEL_ALIASES: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("gpt-4.1-mini-2025-04-14", "gpt-4.1-mini"),
        ("o4-mini-2025-04-16", "o4-mini"),
    ])
});

static DEFAULT_CAPABILITIES: LazyLock<Capabilities> = LazyLock::new(Capabilities::default);

/// Capabilities for a model id, honoring the alias fold. Unknown ids return
/// the conservative default.
pub fn capabilities_for(model_id: &str) -> &'static Capabilities {
    let folded = MODEL_ALIASES.get(model_id).copied().unwrap_or(model_id);
    MODEL_CAPABILITIES
        .get(folded)
        .unwrap_or(&DEFAULT_CAPABILITIES)
}
