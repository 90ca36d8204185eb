//! Per-provider circuit breaker.
//!
//! Three states: Closed (normal), Open (failing fast), HalfOpen (probing).
//! Opening is driven by a windowed failure count; recovery by consecutive
//! probe successes under a bounded permit count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::providers::base::ProviderError;
use crate::providers::classify::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window before opening.
    pub failure_threshold: u32,
    /// Consecutive successes to close from half-open.
    pub success_threshold: u32,
    /// Wait before attempting recovery.
    pub timeout: Duration,
    /// Probe permits while half-open.
    pub half_open_requests: u32,
    /// Window for failure counting.
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_requests: 3,
            window_size: Duration::from_secs(60),
        }
    }
}

/// Counters and timestamps for one breaker.
#[derive(Debug, Default, Clone)]
pub struct CircuitStats {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    failure_timestamps: Vec<Instant>,
}

impl CircuitStats {
    fn record_success(&mut self) {
        self.total_requests += 1;
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.total_requests += 1;
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.failure_timestamps.push(Instant::now());
    }

    fn failures_in_window(&mut self, window: Duration) -> u32 {
        let cutoff = Instant::now().checked_sub(window);
        if let Some(cutoff) = cutoff {
            self.failure_timestamps.retain(|ts| *ts > cutoff);
        }
        self.failure_timestamps.len() as u32
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_failures as f64 / self.total_requests as f64
    }
}

/// Callback invoked on state transitions. Must not block; panics are caught
/// and logged.
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

struct BreakerInner {
    state: CircuitState,
    stats: CircuitStats,
    half_open_permits: u32,
    transition_time: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    on_state_change: Option<StateChangeCallback>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                stats: CircuitStats::default(),
                half_open_permits: 0,
                transition_time: None,
            }),
            on_state_change: None,
        }
    }

    pub fn with_state_change_callback(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        if let Some(callback) = &self.on_state_change {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&self.name, from, to);
            }));
            if result.is_err() {
                error!(breaker = %self.name, "state-change callback panicked");
            }
        }
    }

    fn denied_error(&self, state: CircuitState) -> ProviderError {
        let mut err = ProviderError::new(
            format!("Circuit breaker {} is {}", self.name, state.as_str()),
            self.name.clone(),
        )
        .with_status(503);
        err.error_category = ErrorCategory::ServerError;
        err.is_retryable = true;
        err
    }

    /// Acquire permission to run one call. Returns the denial error when the
    /// breaker is open (unexpired) or half-open with no permits left.
    async fn acquire(&self) -> Result<(), ProviderError> {
        let mut transition: Option<(CircuitState, CircuitState)> = None;
        let result = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CircuitState::Closed => Ok(()),
                CircuitState::Open => {
                    let expired = inner
                        .transition_time
                        .is_none_or(|t| t.elapsed() >= self.config.timeout);
                    if expired {
                        info!(breaker = %self.name, "transitioning open -> half_open");
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_permits = self.config.half_open_requests;
                        inner.stats.consecutive_successes = 0;
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        // This call consumes the first probe permit.
                        inner.half_open_permits = inner.half_open_permits.saturating_sub(1);
                        Ok(())
                    } else {
                        Err(self.denied_error(CircuitState::Open))
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_permits > 0 {
                        inner.half_open_permits -= 1;
                        Ok(())
                    } else {
                        Err(self.denied_error(CircuitState::HalfOpen))
                    }
                }
            }
        };
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
        result
    }

    pub async fn record_success(&self) {
        let mut transition: Option<(CircuitState, CircuitState)> = None;
        {
            let mut inner = self.inner.lock().await;
            inner.stats.record_success();
            if inner.state == CircuitState::HalfOpen
                && inner.stats.consecutive_successes >= self.config.success_threshold
            {
                info!(breaker = %self.name, "transitioning half_open -> closed");
                inner.state = CircuitState::Closed;
                inner.transition_time = None;
                inner.half_open_permits = 0;
                inner.stats.failure_timestamps.clear();
                transition = Some((CircuitState::HalfOpen, CircuitState::Closed));
            }
        }
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
    }

    pub async fn record_failure(&self) {
        let mut transition: Option<(CircuitState, CircuitState)> = None;
        {
            let mut inner = self.inner.lock().await;
            inner.stats.record_failure();
            match inner.state {
                CircuitState::Closed => {
                    let failures = inner.stats.failures_in_window(self.config.window_size);
                    if failures >= self.config.failure_threshold {
                        warn!(
                            breaker = %self.name,
                            failures, "failure threshold reached, opening circuit"
                        );
                        inner.state = CircuitState::Open;
                        inner.transition_time = Some(Instant::now());
                        transition = Some((CircuitState::Closed, CircuitState::Open));
                    }
                }
                CircuitState::HalfOpen => {
                    warn!(breaker = %self.name, "probe failed, reopening circuit");
                    inner.state = CircuitState::Open;
                    inner.transition_time = Some(Instant::now());
                    transition = Some((CircuitState::HalfOpen, CircuitState::Open));
                }
                CircuitState::Open => {}
            }
        }
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
    }

    /// Execute a call through the breaker: acquire permission, run, record
    /// the outcome.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        E: From<ProviderError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire().await.map_err(E::from)?;
        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(error) => {
                self.record_failure().await;
                Err(error)
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> CircuitStats {
        self.inner.lock().await.stats.clone()
    }

    /// Return to Closed and clear all statistics.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.stats = CircuitStats::default();
        inner.half_open_permits = 0;
        inner.transition_time = None;
        info!(breaker = %self.name, "circuit breaker reset");
    }
}

/// Process-wide registry of breakers, keyed by `(provider, tool?)` strings.
#[derive(Default)]
pub struct CircuitBreakerManager {
    breakers: StdMutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        name: &str,
        config: &CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.get(name).cloned()
    }

    pub async fn states(&self) -> HashMap<String, CircuitState> {
        let breakers: Vec<(String, Arc<CircuitBreaker>)> = {
            let guard = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut states = HashMap::new();
        for (name, breaker) in breakers {
            states.insert(name, breaker.state().await);
        }
        states
    }

    pub async fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let guard = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        for breaker in breakers {
            breaker.reset().await;
        }
    }
}
