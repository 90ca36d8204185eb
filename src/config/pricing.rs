//! Pricing override loading.
//!
//! Internal feature for development/debugging only; requires
//! `STEER_INTERNAL_PRICING_OVERRIDES_ENABLED=true`. Sources, in priority
//! order: inline JSON env var, file path env var, `~/.steer/pricing_overrides.json`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::registry::models::ModelConfig;

const OVERRIDES_ENABLED: &str = "STEER_INTERNAL_PRICING_OVERRIDES_ENABLED";
const OVERRIDES_JSON: &str = "STEER_PRICING_OVERRIDES_JSON";
const OVERRIDES_FILE: &str = "STEER_PRICING_OVERRIDES_FILE";

/// Per-model pricing override, all rates per 1K tokens.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PricingOverride {
    pub input_cost_per_1k_tokens: Option<f64>,
    pub output_cost_per_1k_tokens: Option<f64>,
    pub cached_input_cost_per_1k_tokens: Option<f64>,
    /// Legacy blended rate.
    pub cost_per_1k_tokens: Option<f64>,
}

impl PricingOverride {
    /// An override must carry at least one rate, input/output must come as a
    /// pair, and every rate must be positive.
    pub fn is_valid(&self) -> bool {
        let rates = [
            self.input_cost_per_1k_tokens,
            self.output_cost_per_1k_tokens,
            self.cached_input_cost_per_1k_tokens,
            self.cost_per_1k_tokens,
        ];
        if rates.iter().all(Option::is_none) {
            return false;
        }
        if self.input_cost_per_1k_tokens.is_some() != self.output_cost_per_1k_tokens.is_some() {
            warn!("pricing override must include both input and output costs");
            return false;
        }
        rates.iter().flatten().all(|r| *r > 0.0)
    }
}

fn default_overrides_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".steer").join("pricing_overrides.json"))
}

fn parse_overrides(source: &str, raw: &str) -> Option<HashMap<String, PricingOverride>> {
    match serde_json::from_str::<HashMap<String, PricingOverride>>(raw) {
        Ok(overrides) => {
            info!(
                "loaded pricing overrides for {} models from {}",
                overrides.len(),
                source
            );
            Some(overrides)
        }
        Err(e) => {
            error!("failed to parse pricing overrides from {}: {}", source, e);
            None
        }
    }
}

/// Load pricing overrides from the environment or the default file.
pub fn load_pricing_overrides() -> HashMap<String, PricingOverride> {
    let enabled = std::env::var(OVERRIDES_ENABLED)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !enabled {
        return HashMap::new();
    }

    if let Ok(json_str) = std::env::var(OVERRIDES_JSON) {
        if let Some(overrides) = parse_overrides("environment", &json_str) {
            return overrides;
        }
    }

    if let Ok(path) = std::env::var(OVERRIDES_FILE) {
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                if let Some(overrides) = parse_overrides(&path, &raw) {
                    return overrides;
                }
            }
            Err(e) => error!("failed to read pricing overrides from {}: {}", path, e),
        }
    }

    if let Some(path) = default_overrides_path() {
        if path.exists() {
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Some(overrides) = parse_overrides(&path.display().to_string(), &raw) {
                    return overrides;
                }
            }
        }
    }

    HashMap::new()
}

/// Apply overrides to model configurations in place. Invalid entries and
/// unknown model ids are skipped with a warning.
pub fn apply_pricing_overrides(
    configs: &mut HashMap<String, ModelConfig>,
    overrides: &HashMap<String, PricingOverride>,
) {
    for (model_id, pricing) in overrides {
        if !pricing.is_valid() {
            warn!("invalid pricing override for {}, skipping", model_id);
            continue;
        }
        let Some(config) = configs.get_mut(model_id) else {
            warn!("pricing override for unknown model: {}", model_id);
            continue;
        };
        if let Some(rate) = pricing.input_cost_per_1k_tokens {
            config.input_cost_per_1k_tokens = Some(rate);
        }
        if let Some(rate) = pricing.output_cost_per_1k_tokens {
            config.output_cost_per_1k_tokens = Some(rate);
        }
        if let Some(rate) = pricing.cached_input_cost_per_1k_tokens {
            config.cached_input_cost_per_1k_tokens = Some(rate);
        }
        debug!("applied pricing overrides for {}", model_id);
    }
}
