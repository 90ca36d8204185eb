use thiserror::Error;

use crate::orchestration::errors::OrchestrationError;
use crate::providers::base::ProviderError;

/// Typed error hierarchy for the SDK.
///
/// Use at module boundaries (router calls, orchestration, CLI). Internal/leaf
/// functions can continue using `anyhow::Result` — the `Internal` variant
/// allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum SteerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model '{0}' is not available")]
    ModelUnavailable(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `SteerError`.
pub type SteerResult<T> = std::result::Result<T, SteerError>;

impl SteerError {
    /// Whether this error is retryable (transient provider errors, budget
    /// and validation failures are not).
    pub fn is_retryable(&self) -> bool {
        match self {
            SteerError::Provider(e) => e.is_retryable,
            SteerError::Orchestration(e) => e.is_retryable(),
            _ => false,
        }
    }
}
