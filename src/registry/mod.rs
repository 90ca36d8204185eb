pub mod capabilities;
pub mod models;
pub mod policy;

pub use capabilities::{Capabilities, DeltaFormat, capabilities_for};
pub use models::{ModelConfig, Provider, default_model, is_model_available, model_config, model_configs};
pub use policy::{
    MaxTokensField, cache_control_config, deterministic_settings, format_responses_api_schema,
    map_max_tokens_field, should_use_responses_api,
};
