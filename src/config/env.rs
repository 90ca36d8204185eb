//! Environment-variable gates for provider availability and runtime tuning.

use std::time::Duration;

pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const XAI_API_KEY: &str = "XAI_API_KEY";

const OPENAI_TIMEOUT: &str = "OPENAI_TIMEOUT";
const BYPASS_AVAILABILITY_CHECK: &str = "STEER_SDK_BYPASS_AVAILABILITY_CHECK";
const STREAMING_STATE_TTL: &str = "STEER_STREAMING_STATE_TTL";

const DEFAULT_OPENAI_TIMEOUT_SECS: u64 = 60;
const DEFAULT_STREAMING_STATE_TTL_SECS: u64 = 900;

/// API key for a provider tag, or `None` when unset/empty.
pub fn api_key_for(provider: &str) -> Option<String> {
    let var = match provider {
        "openai" => OPENAI_API_KEY,
        "anthropic" => ANTHROPIC_API_KEY,
        "xai" => XAI_API_KEY,
        _ => return None,
    };
    std::env::var(var).ok().filter(|k| !k.is_empty())
}

/// True when `STEER_SDK_BYPASS_AVAILABILITY_CHECK=true` (test harnesses).
pub fn availability_bypassed() -> bool {
    std::env::var(BYPASS_AVAILABILITY_CHECK)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// OpenAI HTTP request timeout, overridable via `OPENAI_TIMEOUT` (seconds).
pub fn openai_timeout_secs() -> Duration {
    let secs = std::env::var(OPENAI_TIMEOUT)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_OPENAI_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// TTL for retained stream states, overridable via `STEER_STREAMING_STATE_TTL`.
pub fn streaming_state_ttl_secs() -> u64 {
    std::env::var(STREAMING_STATE_TTL)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_STREAMING_STATE_TTL_SECS)
}
