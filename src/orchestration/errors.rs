//! Orchestration-level errors.

use thiserror::Error;

use crate::providers::base::ProviderError;
use crate::providers::classify::{ErrorCategory, ErrorClassification};
use crate::reliability::retry::RetryableError;

/// Resource dimension that ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    Time,
    Tokens,
    Cost,
}

impl BudgetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Tokens => "tokens",
            Self::Cost => "cost",
        }
    }
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Budget exceeded: {kind} limit {limit}, actual {actual}")]
    BudgetExceeded {
        kind: BudgetKind,
        limit: f64,
        actual: f64,
    },

    #[error("Idempotency conflict for key '{key}': {message}")]
    Conflict { key: String, message: String },

    #[error("Tool '{0}' not found")]
    ToolNotFound(String),

    #[error("{message}")]
    Orchestrator {
        message: String,
        code: String,
        is_retryable: bool,
    },

    #[error("Schema validation failed{}: {message}", .pointer.as_deref().map(|p| format!(" at {}", p)).unwrap_or_default())]
    Schema {
        message: String,
        pointer: Option<String>,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl OrchestrationError {
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            message: "request with same key but different payload already exists".into(),
        }
    }

    pub fn orchestrator(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Orchestrator {
            message: message.into(),
            code: code.into(),
            is_retryable: false,
        }
    }

    /// Short machine-readable code for result payloads.
    pub fn code(&self) -> &str {
        match self {
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::Conflict { .. } => "CONFLICT",
            Self::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Self::Orchestrator { code, .. } => code,
            Self::Schema { .. } => "SCHEMA_ERROR",
            Self::Provider(e) => e.error_category.as_str(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable,
            Self::Orchestrator { is_retryable, .. } => *is_retryable,
            _ => false,
        }
    }
}

impl RetryableError for OrchestrationError {
    fn classification(&self) -> ErrorClassification {
        match self {
            Self::Provider(e) => e.classification(),
            _ => ErrorClassification {
                category: ErrorCategory::Unknown,
                is_retryable: self.is_retryable(),
                suggested_delay: None,
                user_message: None,
            },
        }
    }

    fn explicitly_retryable(&self) -> bool {
        self.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exceeded_display() {
        let err = OrchestrationError::BudgetExceeded {
            kind: BudgetKind::Tokens,
            limit: 100.0,
            actual: 150.0,
        };
        assert_eq!(err.to_string(), "Budget exceeded: tokens limit 100, actual 150");
        assert_eq!(err.code(), "BUDGET_EXCEEDED");
        assert!(!err.is_retryable());
    }

    #[test]
    fn schema_error_with_pointer() {
        let err = OrchestrationError::Schema {
            message: "expected integer".into(),
            pointer: Some("/a".into()),
        };
        assert!(err.to_string().contains("at /a"));
    }

    #[test]
    fn provider_error_passthrough() {
        let mut inner = ProviderError::new("503", "openai").with_status(503);
        inner.is_retryable = true;
        let err: OrchestrationError = inner.into();
        assert!(err.is_retryable());
    }
}
