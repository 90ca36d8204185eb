//! Usage normalization and cost calculation.
//!
//! Providers report token accounting under different field names; everything
//! funnels through `normalize_usage` so the rest of the SDK sees one shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::registry::models::{ModelConfig, Provider};

/// Uniform usage shape across providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cache_info: Map<String, Value>,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cache_info: Map::new(),
        }
    }

    /// Cached prompt tokens reported by the provider, if any.
    pub fn cached_tokens(&self) -> u64 {
        self.cache_info
            .get("cached_tokens")
            .and_then(Value::as_u64)
            .or_else(|| {
                self.cache_info
                    .get("cache_read_input_tokens")
                    .and_then(Value::as_u64)
            })
            .unwrap_or(0)
    }

    /// Whether this usage was estimated rather than provider-reported.
    pub fn is_estimated(&self) -> bool {
        self.cache_info.contains_key("estimation_method")
    }

    /// Mark this usage as estimated with the given method and confidence.
    pub fn mark_estimated(&mut self, method: &str, confidence: f64) {
        self.cache_info
            .insert("estimation_method".into(), json!(method));
        self.cache_info
            .insert("estimation_confidence".into(), json!(confidence));
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

fn get_u64(raw: &Value, key: &str) -> Option<u64> {
    raw.get(key).and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_f64().map(|f| f.max(0.0) as u64))
    })
}

fn first_u64(raw: &Value, keys: &[&str]) -> u64 {
    keys.iter()
        .find_map(|k| get_u64(raw, k))
        .unwrap_or(0)
}

/// Normalize raw provider usage into the standard shape.
///
/// Post-condition: all counts non-negative, and `total_tokens` equals
/// `prompt + completion` whenever the provider did not supply a total.
pub fn normalize_usage(raw: Option<&Value>, provider: Provider) -> Usage {
    let Some(raw) = raw else {
        return Usage::default();
    };

    let mut usage = Usage::default();
    match provider {
        Provider::OpenAi => {
            usage.prompt_tokens = first_u64(raw, &["prompt_tokens"]);
            usage.completion_tokens = first_u64(raw, &["completion_tokens"]);
            usage.total_tokens = first_u64(raw, &["total_tokens"]);
            if let Some(details) = raw.get("prompt_tokens_details") {
                if let Some(cached) = get_u64(details, "cached_tokens") {
                    usage.cache_info.insert("cached_tokens".into(), json!(cached));
                    usage
                        .cache_info
                        .insert("prompt_tokens_details".into(), details.clone());
                }
            }
            if let Some(cached) = get_u64(raw, "cached_tokens") {
                usage.cache_info.insert("cached_tokens".into(), json!(cached));
            }
        }
        Provider::Anthropic => {
            usage.prompt_tokens = first_u64(raw, &["input_tokens"]);
            usage.completion_tokens = first_u64(raw, &["output_tokens"]);
            usage.total_tokens = first_u64(raw, &["total_tokens"]);
            if raw.get("cache_creation_input_tokens").is_some()
                || raw.get("cache_read_input_tokens").is_some()
            {
                usage.cache_info.insert(
                    "cache_creation_input_tokens".into(),
                    json!(first_u64(raw, &["cache_creation_input_tokens"])),
                );
                usage.cache_info.insert(
                    "cache_read_input_tokens".into(),
                    json!(first_u64(raw, &["cache_read_input_tokens"])),
                );
            }
        }
        Provider::Xai => {
            usage.prompt_tokens = first_u64(raw, &["prompt_tokens", "input_tokens"]);
            usage.completion_tokens = first_u64(raw, &["completion_tokens", "output_tokens"]);
            usage.total_tokens = first_u64(raw, &["total_tokens"]);
        }
    }

    if usage.total_tokens == 0 {
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
    }
    usage
}

/// Cost components, all in USD.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_savings: f64,
    pub total_cost: f64,
}

/// Compute cost for a usage against a model's pricing. Cached tokens are
/// billed at the cached rate instead of the input rate, expressed as a
/// savings subtraction; the result never goes negative.
pub fn calculate_cost(usage: &Usage, config: &ModelConfig) -> Option<(f64, CostBreakdown)> {
    let input_rate = config.input_cost_per_1k_tokens?;
    let output_rate = config.output_cost_per_1k_tokens?;

    let input_cost = (usage.prompt_tokens as f64 / 1000.0) * input_rate;
    let output_cost = (usage.completion_tokens as f64 / 1000.0) * output_rate;

    let mut cache_savings = 0.0;
    if let Some(cached_rate) = config.cached_input_cost_per_1k_tokens {
        let cached = usage.cached_tokens();
        if cached > 0 {
            cache_savings = (cached as f64 / 1000.0) * (input_rate - cached_rate);
        }
    }

    let total = (input_cost + output_cost - cache_savings).max(0.0);
    Some((
        total,
        CostBreakdown {
            input_cost,
            output_cost,
            cache_savings,
            total_cost: total,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::models::model_config;

    #[test]
    fn openai_field_mapping() {
        let raw = json!({
            "prompt_tokens": 10,
            "completion_tokens": 5,
            "total_tokens": 15,
            "prompt_tokens_details": {"cached_tokens": 4}
        });
        let usage = normalize_usage(Some(&raw), Provider::OpenAi);
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(usage.cached_tokens(), 4);
    }

    #[test]
    fn anthropic_field_mapping() {
        let raw = json!({
            "input_tokens": 5,
            "output_tokens": 2,
            "cache_read_input_tokens": 3,
            "cache_creation_input_tokens": 0
        });
        let usage = normalize_usage(Some(&raw), Provider::Anthropic);
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 2);
        // Total derived when provider supplies none.
        assert_eq!(usage.total_tokens, 7);
        assert_eq!(usage.cached_tokens(), 3);
    }

    #[test]
    fn xai_tries_common_names() {
        let raw = json!({"input_tokens": 8, "output_tokens": 3});
        let usage = normalize_usage(Some(&raw), Provider::Xai);
        assert_eq!(usage.prompt_tokens, 8);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 11);
    }

    #[test]
    fn missing_usage_is_all_zero() {
        let usage = normalize_usage(None, Provider::Xai);
        assert_eq!(usage, Usage::default());
    }

    #[test]
    fn float_counts_coerced_to_integers() {
        let raw = json!({"prompt_tokens": 10.0, "completion_tokens": 5.7});
        let usage = normalize_usage(Some(&raw), Provider::OpenAi);
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
    }

    #[test]
    fn estimation_marker_round_trip() {
        let mut usage = Usage::new(10, 5);
        assert!(!usage.is_estimated());
        usage.mark_estimated("CharacterAggregator", 0.65);
        assert!(usage.is_estimated());
        assert_eq!(
            usage.cache_info["estimation_confidence"],
            json!(0.65)
        );
    }

    #[test]
    fn cost_with_cache_savings() {
        let config = model_config("gpt-4o-mini");
        let mut usage = Usage::new(1000, 1000);
        usage.cache_info.insert("cached_tokens".into(), json!(1000));
        let (cost, breakdown) = calculate_cost(&usage, config).unwrap();
        // input 0.00015 + output 0.0006 − savings (0.00015 − 0.000075)
        let expected = 0.000_15 + 0.0006 - (0.000_15 - 0.000_075);
        assert!((cost - expected).abs() < 1e-12);
        assert!(breakdown.cache_savings > 0.0);
        assert_eq!(breakdown.total_cost, cost);
    }

    #[test]
    fn cost_never_negative() {
        let mut config = model_config("gpt-4o-mini").clone();
        config.cached_input_cost_per_1k_tokens = Some(0.0);
        let mut usage = Usage::new(0, 0);
        usage
            .cache_info
            .insert("cached_tokens".into(), json!(1_000_000));
        let (cost, _) = calculate_cost(&usage, &config).unwrap();
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn cost_none_without_pricing() {
        let mut config = model_config("gpt-4o-mini").clone();
        config.input_cost_per_1k_tokens = None;
        assert!(calculate_cost(&Usage::new(10, 5), &config).is_none());
    }
}
