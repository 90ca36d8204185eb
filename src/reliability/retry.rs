//! Policy-driven retry with exponential backoff and jitter.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::providers::base::ProviderError;
use crate::providers::classify::{ErrorCategory, ErrorClassification, classify_provider_error};

/// Errors the retry manager can reason about.
pub trait RetryableError: std::fmt::Display {
    fn classification(&self) -> ErrorClassification;

    /// Explicit opt-in from the producer; bypasses the per-category policy
    /// check (but never the attempt/delay caps).
    fn explicitly_retryable(&self) -> bool {
        false
    }
}

impl RetryableError for ProviderError {
    fn classification(&self) -> ErrorClassification {
        classify_provider_error(self)
    }

    fn explicitly_retryable(&self) -> bool {
        self.is_retryable
    }
}

/// Configurable retry policy. All delays in seconds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub backoff_factor: f64,
    pub jitter_factor: f64,
    pub retry_on_timeout: bool,
    pub retry_on_rate_limit: bool,
    pub retry_on_server_error: bool,
    pub retry_on_network_error: bool,
    pub respect_retry_after: bool,
    pub exponential_backoff: bool,
    pub max_total_delay: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: 1.0,
            max_delay: 60.0,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
            retry_on_timeout: true,
            retry_on_rate_limit: true,
            retry_on_server_error: true,
            retry_on_network_error: true,
            respect_retry_after: true,
            exponential_backoff: true,
            max_total_delay: 300.0,
        }
    }
}

impl RetryPolicy {
    pub fn should_retry_category(&self, category: ErrorCategory) -> bool {
        match category {
            ErrorCategory::Timeout => self.retry_on_timeout,
            ErrorCategory::RateLimit => self.retry_on_rate_limit,
            ErrorCategory::ServerError => self.retry_on_server_error,
            ErrorCategory::Network => self.retry_on_network_error,
            _ => false,
        }
    }
}

/// Per-request retry bookkeeping.
#[derive(Debug, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub total_delay: f64,
    pub errors: Vec<String>,
    pub error_categories: Vec<ErrorCategory>,
}

impl RetryState {
    fn add_attempt(&mut self, error: String, delay: f64, category: ErrorCategory) {
        self.attempts += 1;
        self.total_delay += delay;
        self.errors.push(error);
        self.error_categories.push(category);
    }
}

/// Aggregate retry counters for observability.
#[derive(Debug, Default, Clone)]
pub struct RetryMetrics {
    pub attempts: HashMap<String, u64>,
    pub successes: HashMap<String, u64>,
    pub failures: HashMap<String, u64>,
    pub error_counts: HashMap<ErrorCategory, u64>,
    pub total_retry_delay: f64,
}

/// Executes operations under a retry policy, tracking per-request state and
/// aggregate metrics.
#[derive(Default)]
pub struct RetryManager {
    default_policy: RetryPolicy,
    metrics: Mutex<RetryMetrics>,
}

impl RetryManager {
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            default_policy,
            metrics: Mutex::new(RetryMetrics::default()),
        }
    }

    pub fn metrics(&self) -> RetryMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn record_attempt(&self, provider: &str, category: ErrorCategory, delay: f64) {
        if let Ok(mut metrics) = self.metrics.lock() {
            *metrics
                .attempts
                .entry(format!("{}:{}", provider, category.as_str()))
                .or_default() += 1;
            *metrics.error_counts.entry(category).or_default() += 1;
            metrics.total_retry_delay += delay;
        }
    }

    fn record_outcome(&self, provider: &str, success: bool) {
        if let Ok(mut metrics) = self.metrics.lock() {
            let map = if success {
                &mut metrics.successes
            } else {
                &mut metrics.failures
            };
            *map.entry(provider.to_string()).or_default() += 1;
        }
    }

    fn compute_delay(
        policy: &RetryPolicy,
        classification: &ErrorClassification,
        attempts: u32,
    ) -> f64 {
        let base = if policy.respect_retry_after && classification.suggested_delay.is_some() {
            classification.suggested_delay.unwrap_or(policy.initial_delay)
        } else if policy.exponential_backoff {
            policy.initial_delay * policy.backoff_factor.powi(attempts as i32)
        } else {
            policy.initial_delay
        };
        let base = base.min(policy.max_delay);
        let jittered = base * (1.0 + fastrand::f64() * policy.jitter_factor);
        jittered.min(policy.max_delay).max(0.1)
    }

    /// Run `operation` until it succeeds or the policy is exhausted.
    ///
    /// The operation receives the current attempt number (0-based). Errors
    /// that are non-retryable, in a disabled category, or would exceed the
    /// attempt or total-delay caps are returned unchanged.
    pub async fn execute<T, E, F, Fut>(
        &self,
        request_id: &str,
        provider: &str,
        policy: Option<&RetryPolicy>,
        mut operation: F,
    ) -> Result<T, E>
    where
        E: RetryableError,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = policy.unwrap_or(&self.default_policy);
        let mut state = RetryState::default();

        loop {
            match operation(state.attempts).await {
                Ok(value) => {
                    if state.attempts > 0 {
                        self.record_outcome(provider, true);
                        info!(
                            request_id,
                            provider,
                            attempts = state.attempts,
                            total_delay = state.total_delay,
                            "request succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let classification = error.classification();
                    let category_allowed = error.explicitly_retryable()
                        || policy.should_retry_category(classification.category);

                    if !classification.is_retryable && !error.explicitly_retryable() {
                        self.record_outcome(provider, false);
                        return Err(error);
                    }
                    if !category_allowed {
                        self.record_outcome(provider, false);
                        return Err(error);
                    }
                    if state.attempts + 1 >= policy.max_attempts {
                        self.record_outcome(provider, false);
                        return Err(error);
                    }

                    let delay = Self::compute_delay(policy, &classification, state.attempts);
                    if state.total_delay + delay > policy.max_total_delay {
                        warn!(
                            request_id,
                            provider,
                            total_delay = state.total_delay,
                            "retry budget exhausted"
                        );
                        self.record_outcome(provider, false);
                        return Err(error);
                    }

                    warn!(
                        request_id,
                        provider,
                        attempt = state.attempts + 1,
                        delay_secs = delay,
                        category = classification.category.as_str(),
                        error = %error,
                        "retrying after error"
                    );
                    state.add_attempt(error.to_string(), delay, classification.category);
                    self.record_attempt(provider, classification.category, delay);

                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rate_limited(retry_after: Option<f64>) -> ProviderError {
        let mut err = ProviderError::new("rate limited", "openai").with_status(429);
        err.error_category = ErrorCategory::RateLimit;
        err.is_retryable = true;
        err.retry_after = retry_after;
        err
    }

    fn auth_error() -> ProviderError {
        let mut err = ProviderError::new("bad key", "openai").with_status(401);
        err.error_category = ErrorCategory::Authentication;
        err
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: 0.01,
            max_delay: 0.05,
            max_total_delay: 10.0,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let manager = RetryManager::new(fast_policy());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<&str, ProviderError> = manager
            .execute("req-1", "openai", None, move |_attempt| {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(rate_limited(Some(0.01)))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let metrics = manager.metrics();
        assert_eq!(metrics.successes["openai"], 1);
        assert_eq!(metrics.error_counts[&ErrorCategory::RateLimit], 2);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let manager = RetryManager::new(fast_policy());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), ProviderError> = manager
            .execute("req-2", "openai", None, move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(auth_error())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn max_attempts_bounds_calls() {
        let manager = RetryManager::new(fast_policy());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), ProviderError> = manager
            .execute("req-3", "openai", None, move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(rate_limited(Some(0.01)))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn respects_retry_after_delay() {
        let manager = RetryManager::new(RetryPolicy {
            initial_delay: 10.0, // would be slow if retry-after were ignored
            jitter_factor: 0.1,
            ..RetryPolicy::default()
        });
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let started = Instant::now();
        let result: Result<&str, ProviderError> = manager
            .execute("req-4", "openai", None, move |_| {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(rate_limited(Some(0.05)))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        let elapsed = started.elapsed().as_secs_f64();
        // One sleep in [0.05, 0.05 * 1.1], nowhere near initial_delay.
        assert!(elapsed >= 0.05, "elapsed {}", elapsed);
        assert!(elapsed < 1.0, "elapsed {}", elapsed);
    }

    #[tokio::test]
    async fn category_disabled_in_policy_fails_fast() {
        let policy = RetryPolicy {
            retry_on_rate_limit: false,
            ..fast_policy()
        };
        let manager = RetryManager::new(policy);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        // explicitly_retryable=false so the category gate applies
        let result: Result<(), ProviderError> = manager
            .execute("req-5", "openai", None, move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let mut err = rate_limited(None);
                    err.is_retryable = false;
                    // Classification still marks rate limits retryable; the
                    // disabled category must stop the retry.
                    Err(err)
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn max_total_delay_stops_retrying() {
        let policy = RetryPolicy {
            initial_delay: 0.2,
            max_total_delay: 0.1,
            respect_retry_after: false,
            ..RetryPolicy::default()
        };
        let manager = RetryManager::new(policy);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), ProviderError> = manager
            .execute("req-6", "openai", None, move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(rate_limited(None))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_floor_is_100ms() {
        let policy = RetryPolicy {
            initial_delay: 0.0001,
            respect_retry_after: false,
            ..RetryPolicy::default()
        };
        let classification = ErrorClassification {
            category: ErrorCategory::ServerError,
            is_retryable: true,
            suggested_delay: None,
            user_message: None,
        };
        let delay = RetryManager::compute_delay(&policy, &classification, 0);
        assert!(delay >= 0.1);
    }
}
