//! Error classification across providers.
//!
//! Classification order: provider-specific error-type name, then HTTP status
//! code, then message-pattern match (timeout before network so "connection
//! timeout" lands on the right category). The resulting category drives retry
//! and circuit-breaker decisions.

use serde::{Deserialize, Serialize};

use crate::providers::base::ProviderError;

/// Standard error categories across all providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    RateLimit,
    Validation,
    ServerError,
    Network,
    Timeout,
    ContentFilter,
    NotFound,
    PermissionDenied,
    Conflict,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Validation => "validation",
            Self::ServerError => "server_error",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::ContentFilter => "content_filter",
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::Conflict => "conflict",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimit | Self::ServerError | Self::Network
        )
    }

    /// Default retry delay (seconds) when the provider suggests nothing.
    pub fn default_delay(self) -> Option<f64> {
        match self {
            Self::RateLimit => Some(60.0),
            Self::Timeout => Some(5.0),
            Self::ServerError => Some(10.0),
            _ => None,
        }
    }
}

/// Detailed classification result.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub is_retryable: bool,
    pub suggested_delay: Option<f64>,
    pub user_message: Option<String>,
}

impl ErrorClassification {
    fn from_category(category: ErrorCategory) -> Self {
        Self {
            category,
            is_retryable: category.is_retryable(),
            suggested_delay: category.default_delay(),
            user_message: None,
        }
    }
}

/// Provider error type names, as they appear in JSON error bodies
/// (`error.type`). Shared across OpenAI-shaped providers; Anthropic uses the
/// `*_error` suffix variants.
fn category_for_type_name(type_name: &str) -> Option<ErrorCategory> {
    let category = match type_name {
        "authentication_error" | "invalid_api_key" => ErrorCategory::Authentication,
        "rate_limit_error" | "rate_limit_exceeded" | "tokens" | "requests" => {
            ErrorCategory::RateLimit
        }
        "invalid_request_error" | "bad_request_error" | "unprocessable_entity_error" => {
            ErrorCategory::Validation
        }
        "not_found_error" => ErrorCategory::NotFound,
        "permission_error" | "permission_denied_error" => ErrorCategory::PermissionDenied,
        "conflict_error" => ErrorCategory::Conflict,
        "api_error" | "internal_server_error" | "overloaded_error" => ErrorCategory::ServerError,
        "timeout_error" => ErrorCategory::Timeout,
        "content_filter" | "content_policy_violation" => ErrorCategory::ContentFilter,
        _ => return None,
    };
    Some(category)
}

fn category_for_status(status: u16) -> ErrorCategory {
    match status {
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::PermissionDenied,
        404 => ErrorCategory::NotFound,
        409 => ErrorCategory::Conflict,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        400..=499 => ErrorCategory::Validation,
        _ => ErrorCategory::Unknown,
    }
}

/// Message patterns in priority order; earlier groups win so that
/// "request timeout" is a timeout, not a network error.
const MESSAGE_PATTERNS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Timeout,
        &["timeout", "timed out", "request timeout", "read timeout"],
    ),
    (
        ErrorCategory::RateLimit,
        &[
            "rate limit",
            "too many requests",
            "quota exceeded",
            "too_many_requests",
            "rate_limit_exceeded",
            "throttled",
            "retry later",
            "request limit",
            "usage limit",
            "exceeded quota",
            "try again later",
        ],
    ),
    (
        ErrorCategory::Authentication,
        &[
            "invalid api key",
            "authentication failed",
            "unauthorized",
            "invalid_api_key",
            "auth_error",
        ],
    ),
    (
        ErrorCategory::ContentFilter,
        &[
            "content filter",
            "content_filter",
            "safety filter",
            "harmful content",
            "content policy",
        ],
    ),
    (
        ErrorCategory::ServerError,
        &[
            "server error",
            "internal error",
            "service unavailable",
            "engine_overloaded",
            "server_error",
            "overloaded",
        ],
    ),
    (
        ErrorCategory::Validation,
        &[
            "invalid request",
            "bad request",
            "validation error",
            "invalid_request",
            "context_length_exceeded",
        ],
    ),
    (
        ErrorCategory::Network,
        &[
            "connection error",
            "network error",
            "dns resolution",
            "connection refused",
            "connection reset",
            "connection_error",
            "broken pipe",
        ],
    ),
];

fn category_for_message(message: &str) -> Option<ErrorCategory> {
    let lower = message.to_lowercase();
    for (category, patterns) in MESSAGE_PATTERNS {
        if patterns.iter().any(|p| lower.contains(p)) {
            return Some(*category);
        }
    }
    None
}

/// Classify an error from whatever is known about it.
pub fn classify(
    type_name: Option<&str>,
    status_code: Option<u16>,
    message: &str,
    retry_after: Option<f64>,
) -> ErrorClassification {
    let category = type_name
        .and_then(category_for_type_name)
        .or_else(|| status_code.map(category_for_status).filter(|c| *c != ErrorCategory::Unknown))
        .or_else(|| category_for_message(message))
        .unwrap_or(ErrorCategory::Unknown);

    let mut classification = ErrorClassification::from_category(category);
    if retry_after.is_some() {
        classification.suggested_delay = retry_after;
    }
    classification
}

/// Build a `ProviderError` from an HTTP error response. The body is probed
/// for `{"error": {"type", "message"}}`; the `Retry-After` header (seconds)
/// feeds the suggested delay.
pub fn provider_error_from_response(
    provider: &str,
    status: u16,
    body: &str,
    retry_after_header: Option<f64>,
) -> ProviderError {
    let mut type_name = None;
    let mut message = body.trim().to_string();
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(error) = parsed.get("error") {
            type_name = error
                .get("type")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if let Some(msg) = error.get("message").and_then(|v| v.as_str()) {
                message = msg.to_string();
            }
        }
    }

    let classification = classify(
        type_name.as_deref(),
        Some(status),
        &message,
        retry_after_header,
    );

    ProviderError {
        message: format!("API error ({}): {}", status, message),
        provider: provider.to_string(),
        status_code: Some(status),
        retry_after: classification.suggested_delay,
        is_retryable: classification.is_retryable,
        error_category: classification.category,
        user_message: user_message_for(classification.category),
        original_error: None,
    }
}

/// Build a `ProviderError` from a transport failure.
pub fn provider_error_from_transport(provider: &str, error: &reqwest::Error) -> ProviderError {
    let category = if error.is_timeout() {
        ErrorCategory::Timeout
    } else if error.is_connect() {
        ErrorCategory::Network
    } else {
        category_for_message(&error.to_string()).unwrap_or(ErrorCategory::Network)
    };
    let classification = ErrorClassification::from_category(category);

    ProviderError {
        message: error.to_string(),
        provider: provider.to_string(),
        status_code: error.status().map(|s| s.as_u16()),
        retry_after: classification.suggested_delay,
        is_retryable: classification.is_retryable,
        error_category: category,
        user_message: user_message_for(category),
        original_error: Some(error.to_string()),
    }
}

fn user_message_for(category: ErrorCategory) -> Option<String> {
    let msg = match category {
        ErrorCategory::Authentication => "Invalid API key or authentication failed",
        ErrorCategory::RateLimit => "Rate limit exceeded, please wait before retrying",
        ErrorCategory::Validation => "Invalid request parameters",
        ErrorCategory::ServerError => "Internal server error, please retry",
        ErrorCategory::Network => "Network connection error",
        ErrorCategory::Timeout => "Request timed out",
        ErrorCategory::ContentFilter => "Request was blocked by a content filter",
        ErrorCategory::NotFound => "Resource not found",
        ErrorCategory::PermissionDenied => "Permission denied for this operation",
        ErrorCategory::Conflict => "Request conflicts with current state",
        ErrorCategory::Unknown => return None,
    };
    Some(msg.to_string())
}

/// Classify an existing `ProviderError` (for the reliability layer).
pub fn classify_provider_error(error: &ProviderError) -> ErrorClassification {
    let mut classification = classify(
        None,
        error.status_code,
        &error.message,
        error.retry_after,
    );
    // Adapter knowledge wins over re-derivation.
    if error.error_category != ErrorCategory::Unknown {
        classification.category = error.error_category;
        classification.is_retryable = error.error_category.is_retryable();
    }
    if error.is_retryable {
        classification.is_retryable = true;
    }
    classification
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_categories() {
        assert_eq!(category_for_status(401), ErrorCategory::Authentication);
        assert_eq!(category_for_status(403), ErrorCategory::PermissionDenied);
        assert_eq!(category_for_status(404), ErrorCategory::NotFound);
        assert_eq!(category_for_status(409), ErrorCategory::Conflict);
        assert_eq!(category_for_status(429), ErrorCategory::RateLimit);
        assert_eq!(category_for_status(500), ErrorCategory::ServerError);
        assert_eq!(category_for_status(503), ErrorCategory::ServerError);
        assert_eq!(category_for_status(422), ErrorCategory::Validation);
    }

    #[test]
    fn retryable_set_is_fixed() {
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::RateLimit.is_retryable());
        assert!(ErrorCategory::ServerError.is_retryable());
        assert!(ErrorCategory::Network.is_retryable());
        assert!(!ErrorCategory::Authentication.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::ContentFilter.is_retryable());
    }

    #[test]
    fn type_name_beats_status() {
        let c = classify(Some("rate_limit_error"), Some(500), "boom", None);
        assert_eq!(c.category, ErrorCategory::RateLimit);
    }

    #[test]
    fn timeout_pattern_beats_network() {
        let c = classify(None, None, "connection timeout while reading", None);
        assert_eq!(c.category, ErrorCategory::Timeout);
        assert_eq!(c.suggested_delay, Some(5.0));
    }

    #[test]
    fn retry_after_overrides_default_delay() {
        let c = classify(None, Some(429), "too many requests", Some(2.0));
        assert_eq!(c.category, ErrorCategory::RateLimit);
        assert_eq!(c.suggested_delay, Some(2.0));
    }

    #[test]
    fn rate_limit_default_delay_is_60s() {
        let c = classify(None, Some(429), "too many requests", None);
        assert_eq!(c.suggested_delay, Some(60.0));
    }

    #[test]
    fn error_body_parsing() {
        let body = r#"{"error": {"type": "authentication_error", "message": "Invalid API key"}}"#;
        let err = provider_error_from_response("openai", 401, body, None);
        assert_eq!(err.error_category, ErrorCategory::Authentication);
        assert!(!err.is_retryable);
        assert!(err.message.contains("Invalid API key"));
        assert!(err.user_message.is_some());
    }

    #[test]
    fn unparseable_body_falls_back_to_status() {
        let err = provider_error_from_response("anthropic", 503, "<html>oops</html>", None);
        assert_eq!(err.error_category, ErrorCategory::ServerError);
        assert!(err.is_retryable);
        assert_eq!(err.retry_after, Some(10.0));
    }

    #[test]
    fn explicit_retryable_flag_short_circuits() {
        let mut err = ProviderError::new("weird edge case", "openai");
        err.is_retryable = true;
        let c = classify_provider_error(&err);
        assert!(c.is_retryable);
    }

    #[test]
    fn unknown_message_is_unknown_category() {
        let c = classify(None, None, "glitch in the matrix", None);
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(!c.is_retryable);
    }
}
