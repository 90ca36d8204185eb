pub mod anthropic;
pub mod base;
pub mod classify;
pub mod openai;
pub mod sse;
pub mod xai;

use std::time::Duration;

use reqwest::Client;

/// Connect timeout for LLM provider HTTP clients (seconds).
pub(crate) const PROVIDER_CONNECT_TIMEOUT_SECS: u64 = 30;
/// Overall request timeout for LLM provider HTTP clients (seconds).
pub(crate) const PROVIDER_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Build a `reqwest::Client` with standard provider timeouts (30 s connect, 120 s overall).
pub(crate) fn provider_http_client() -> Client {
    provider_http_client_with_timeout(Duration::from_secs(PROVIDER_REQUEST_TIMEOUT_SECS))
}

/// Build a `reqwest::Client` with a caller-supplied overall timeout.
pub(crate) fn provider_http_client_with_timeout(timeout: Duration) -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(PROVIDER_CONNECT_TIMEOUT_SECS))
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Convert an HTTP error response into a classified `ProviderError`,
/// honoring the `Retry-After` header.
pub(crate) async fn error_from_response(
    provider: &str,
    resp: reqwest::Response,
) -> base::ProviderError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok());
    let body = resp.text().await.unwrap_or_default();
    classify::provider_error_from_response(provider, status, &body, retry_after)
}
