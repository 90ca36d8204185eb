//! Model configuration registry: display metadata, limits, and pricing.
//!
//! The table is built once at startup (with pricing overrides applied) and is
//! read-only afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::config::env::{api_key_for, availability_bypassed};
use crate::config::pricing::{apply_pricing_overrides, load_pricing_overrides};

/// Supported model providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Xai,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Xai => "xai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "xai" => Some(Self::Xai),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a single model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub display_name: String,
    pub provider: Provider,
    /// Wire-level model identifier sent to the provider.
    pub model_id: String,
    pub description: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub enabled: bool,
    pub context_length: Option<u32>,
    pub input_cost_per_1k_tokens: Option<f64>,
    pub output_cost_per_1k_tokens: Option<f64>,
    pub cached_input_cost_per_1k_tokens: Option<f64>,
}

impl ModelConfig {
    pub fn has_pricing(&self) -> bool {
        self.input_cost_per_1k_tokens.is_some() && self.output_cost_per_1k_tokens.is_some()
    }
}

fn model(
    name: &str,
    display_name: &str,
    provider: Provider,
    model_id: &str,
    description: &str,
    max_tokens: u32,
    pricing: (f64, f64, Option<f64>),
) -> ModelConfig {
    ModelConfig {
        name: name.to_string(),
        display_name: display_name.to_string(),
        provider,
        model_id: model_id.to_string(),
        description: description.to_string(),
        max_tokens,
        temperature: 0.7,
        enabled: true,
        context_length: None,
        input_cost_per_1k_tokens: Some(pricing.0),
        output_cost_per_1k_tokens: Some(pricing.1),
        cached_input_cost_per_1k_tokens: pricing.2,
    }
}

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

static MODEL_CONFIGS: LazyLock<HashMap<String, ModelConfig>> = LazyLock::new(|| {
    let mut configs = HashMap::new();

    configs.insert(
        "gpt-4o-mini".to_string(),
        model(
            "GPT-4o Mini",
            "GPT-4o Mini",
            Provider::OpenAi,
            "gpt-4o-mini",
            "Smaller version of GPT-4o, faster and more cost-effective",
            8192,
            (0.000_15, 0.0006, Some(0.000_075)),
        ),
    );
    configs.insert(
        "gpt-4o".to_string(),
        ModelConfig {
            context_length: Some(128_000),
            ..model(
                "GPT-4o",
                "GPT-4o",
                Provider::OpenAi,
                "gpt-4o",
                "Optimized GPT-4 with enhanced performance and efficiency",
                16_384,
                (0.0025, 0.01, Some(0.001_25)),
            )
        },
    );
    configs.insert(
        "gpt-4.1-mini".to_string(),
        ModelConfig {
            temperature: 0.1,
            ..model(
                "GPT-4.1 Mini",
                "GPT-4.1 Mini",
                Provider::OpenAi,
                "gpt-4.1-mini-2025-04-14",
                "Latest mini model with enhanced capabilities and cost efficiency",
                16_384,
                (0.0004, 0.0016, Some(0.0001)),
            )
        },
    );
    configs.insert(
        "gpt-4.1-nano".to_string(),
        model(
            "GPT-4.1 Nano",
            "GPT-4.1 Nano",
            Provider::OpenAi,
            "gpt-4.1-nano",
            "Ultra-efficient nano model for simple evaluations and cost optimization",
            2048,
            (0.0001, 0.0004, Some(0.000_025)),
        ),
    );
    configs.insert(
        "gpt-3.5-turbo".to_string(),
        model(
            "GPT-3.5 Turbo",
            "GPT-3.5 Turbo",
            Provider::OpenAi,
            "gpt-3.5-turbo",
            "Fast and efficient model, good for general tasks",
            4096,
            (0.0005, 0.0015, None),
        ),
    );
    configs.insert(
        "gpt-5-mini".to_string(),
        ModelConfig {
            context_length: Some(256_000),
            ..model(
                "GPT-5 Mini",
                "GPT-5 Mini",
                Provider::OpenAi,
                "gpt-5-mini",
                "Next-generation mini model with full Responses API support",
                32_768,
                (0.000_25, 0.002, Some(0.000_025)),
            )
        },
    );
    configs.insert(
        "gpt-5-nano".to_string(),
        ModelConfig {
            context_length: Some(128_000),
            ..model(
                "GPT-5 Nano",
                "GPT-5 Nano",
                Provider::OpenAi,
                "gpt-5-nano",
                "Ultra-efficient nano version of GPT-5 for maximum cost optimization",
                8192,
                (0.000_05, 0.0004, Some(0.000_005)),
            )
        },
    );
    configs.insert(
        "o4-mini".to_string(),
        ModelConfig {
            temperature: 0.1,
            context_length: Some(200_000),
            ..model(
                "O4 Mini",
                "O4 Mini",
                Provider::OpenAi,
                "o4-mini-2025-04-16",
                "Smaller reasoning model optimized for fast, cost-efficient reasoning",
                100_000,
                (0.0011, 0.0044, Some(0.000_275)),
            )
        },
    );

    configs.insert(
        "claude-3-haiku".to_string(),
        ModelConfig {
            context_length: Some(200_000),
            ..model(
                "Claude 3 Haiku",
                "Claude 3",
                Provider::Anthropic,
                "claude-3-haiku-20240307",
                "Fastest and most cost-effective Claude model",
                4096,
                (0.0003, 0.0015, Some(0.000_07)),
            )
        },
    );
    configs.insert(
        "claude-3-5-haiku-20241022".to_string(),
        ModelConfig {
            context_length: Some(200_000),
            ..model(
                "Claude 3.5 Haiku",
                "Claude 3.5 Haiku",
                Provider::Anthropic,
                "claude-3-5-haiku-20241022",
                "Latest fast and efficient Claude model with improved capabilities",
                8192,
                (0.001, 0.005, Some(0.0001)),
            )
        },
    );

    configs.insert(
        "grok-3-mini".to_string(),
        model(
            "Grok 3 Mini",
            "Grok 3 Mini",
            Provider::Xai,
            "grok-3-mini",
            "Cost-effective mini version of Grok 3, optimized for lower latency",
            8192,
            (0.0003, 0.0005, None),
        ),
    );

    let overrides = load_pricing_overrides();
    if !overrides.is_empty() {
        apply_pricing_overrides(&mut configs, &overrides);
    }

    configs
});

/// The full model table (read-only).
pub fn model_configs() -> &'static HashMap<String, ModelConfig> {
    &MODEL_CONFIGS
}

/// Configuration for a model, falling back to the default model for unknown
/// ids.
pub fn model_config(model_id: &str) -> &'static ModelConfig {
    MODEL_CONFIGS
        .get(model_id)
        .unwrap_or_else(|| &MODEL_CONFIGS[DEFAULT_MODEL])
}

pub fn default_model() -> &'static ModelConfig {
    &MODEL_CONFIGS[DEFAULT_MODEL]
}

/// Lightweight availability check: the model must be known and enabled, and
/// the provider API key must be present (unless bypassed for tests).
pub fn is_model_available(model_id: &str) -> bool {
    let Some(config) = MODEL_CONFIGS.get(model_id) else {
        return false;
    };
    if !config.enabled {
        return false;
    }
    if availability_bypassed() {
        return true;
    }
    api_key_for(config.provider.as_str()).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_exists() {
        let cfg = default_model();
        assert_eq!(cfg.provider, Provider::OpenAi);
        assert!(cfg.has_pricing());
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let cfg = model_config("nonexistent-model");
        assert_eq!(cfg.model_id, default_model().model_id);
    }

    #[test]
    fn unknown_model_is_not_available() {
        assert!(!is_model_available("nonexistent-model"));
    }

    #[test]
    fn versioned_wire_id_for_gpt41_mini() {
        assert_eq!(model_config("gpt-4.1-mini").model_id, "gpt-4.1-mini-2025-04-14");
    }

    #[test]
    fn provider_parse_round_trip() {
        for p in [Provider::OpenAi, Provider::Anthropic, Provider::Xai] {
            assert_eq!(Provider::parse(p.as_str()), Some(p));
        }
        assert_eq!(Provider::parse("other"), None);
    }
}
