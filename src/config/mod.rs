pub mod env;
pub mod pricing;

pub use env::{
    api_key_for, availability_bypassed, openai_timeout_secs, streaming_state_ttl_secs,
};
pub use pricing::{PricingOverride, apply_pricing_overrides, load_pricing_overrides};
