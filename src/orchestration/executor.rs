//! Reliable tool execution: per-(provider, tool) circuit breakers, retry,
//! and fallback chaining.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use super::errors::OrchestrationError;
use super::events::OrchestratorEvents;
use super::tool::{Tool, ToolResult};
use crate::reliability::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
use crate::reliability::retry::{RetryManager, RetryPolicy};

/// Reliability configuration for orchestrated tool runs.
#[derive(Debug, Clone)]
pub struct OrchestratorReliabilityConfig {
    pub retry_policy: RetryPolicy,
    /// Circuit-breaker configuration per provider tag, with a `default`.
    pub circuit_breaker_configs: HashMap<String, CircuitBreakerConfig>,
    pub enable_fallback: bool,
    pub max_fallback_attempts: usize,
    pub max_total_attempts: u32,
}

impl Default for OrchestratorReliabilityConfig {
    fn default() -> Self {
        let mut circuit_breaker_configs = HashMap::new();
        circuit_breaker_configs.insert(
            "openai".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                timeout: std::time::Duration::from_secs(60),
                window_size: std::time::Duration::from_secs(300),
                ..CircuitBreakerConfig::default()
            },
        );
        circuit_breaker_configs.insert(
            "anthropic".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 1,
                timeout: std::time::Duration::from_secs(120),
                window_size: std::time::Duration::from_secs(300),
                ..CircuitBreakerConfig::default()
            },
        );
        circuit_breaker_configs.insert(
            "xai".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 4,
                success_threshold: 2,
                timeout: std::time::Duration::from_secs(90),
                window_size: std::time::Duration::from_secs(300),
                ..CircuitBreakerConfig::default()
            },
        );
        circuit_breaker_configs.insert(
            "default".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                timeout: std::time::Duration::from_secs(60),
                window_size: std::time::Duration::from_secs(300),
                ..CircuitBreakerConfig::default()
            },
        );
        Self {
            retry_policy: RetryPolicy::default(),
            circuit_breaker_configs,
            enable_fallback: true,
            max_fallback_attempts: 2,
            max_total_attempts: 10,
        }
    }
}

/// Runs tools through retry + circuit breaker, falling back to alternates on
/// unrecoverable primary failure.
pub struct ReliableToolExecutor {
    config: OrchestratorReliabilityConfig,
    retry: RetryManager,
    breakers: CircuitBreakerManager,
}

impl ReliableToolExecutor {
    pub fn new(config: OrchestratorReliabilityConfig) -> Self {
        let retry = RetryManager::new(config.retry_policy.clone());
        Self {
            config,
            retry,
            breakers: CircuitBreakerManager::new(),
        }
    }

    /// Breaker states keyed by `(provider:tool)`, for the planner.
    pub async fn breaker_states(&self) -> HashMap<String, String> {
        self.breakers
            .states()
            .await
            .into_iter()
            .map(|(key, state)| (key, state.as_str().to_string()))
            .collect()
    }

    fn provider_for(tool: &dyn Tool, options: &Map<String, Value>) -> String {
        if let Some(provider) = tool.provider_hint() {
            return provider.to_string();
        }
        options
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string()
    }

    fn breaker_config(&self, provider: &str) -> CircuitBreakerConfig {
        self.config
            .circuit_breaker_configs
            .get(provider)
            .or_else(|| self.config.circuit_breaker_configs.get("default"))
            .cloned()
            .unwrap_or_default()
    }

    async fn execute_single(
        &self,
        tool: &Arc<dyn Tool>,
        request: &Value,
        options: &Map<String, Value>,
        events: Option<&OrchestratorEvents>,
    ) -> Result<ToolResult, OrchestrationError> {
        let provider = Self::provider_for(tool.as_ref(), options);
        let breaker_key = format!("{}:{}", provider, tool.name());
        let breaker = self
            .breakers
            .get_or_create(&breaker_key, &self.breaker_config(&provider));

        let request_id = options
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        self.retry
            .execute(request_id, &provider, None, |_attempt| {
                let breaker = breaker.clone();
                let tool = tool.clone();
                async move {
                    breaker
                        .call(|| async { tool.execute(request, options, events).await })
                        .await
                }
            })
            .await
    }

    /// Execute the primary tool, then fallbacks, under the configured caps.
    pub async fn execute_with_reliability(
        &self,
        tool: Arc<dyn Tool>,
        request: &Value,
        options: &Map<String, Value>,
        events: Option<&OrchestratorEvents>,
        fallback_tools: &[Arc<dyn Tool>],
    ) -> Result<ToolResult, OrchestrationError> {
        let primary_error = match self.execute_single(&tool, request, options, events).await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if !self.config.enable_fallback || fallback_tools.is_empty() {
                    return Err(error);
                }
                error
            }
        };

        let mut attempts: u32 = self.config.retry_policy.max_attempts;
        for (i, fallback) in fallback_tools
            .iter()
            .take(self.config.max_fallback_attempts)
            .enumerate()
        {
            if attempts >= self.config.max_total_attempts {
                break;
            }
            info!(
                fallback = fallback.name(),
                position = i + 1,
                "attempting fallback tool"
            );
            match self.execute_single(fallback, request, options, events).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    warn!(fallback = fallback.name(), error = %error, "fallback failed");
                    attempts += self.config.retry_policy.max_attempts;
                }
            }
        }

        Err(OrchestrationError::orchestrator(
            format!("All tool attempts failed. Primary error: {}", primary_error),
            "ALL_TOOLS_FAILED",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyTool {
        name: String,
        fail_times: u32,
        calls: AtomicU32,
        retryable: bool,
    }

    impl FlakyTool {
        fn new(name: &str, fail_times: u32, retryable: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail_times,
                calls: AtomicU32::new(0),
                retryable,
            })
        }
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(
            &self,
            _request: &Value,
            _options: &Map<String, Value>,
            _events: Option<&OrchestratorEvents>,
        ) -> Result<ToolResult, OrchestrationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(OrchestrationError::Orchestrator {
                    message: format!("{} transient failure", self.name),
                    code: "TRANSIENT".into(),
                    is_retryable: self.retryable,
                })
            } else {
                Ok(ToolResult::Plain(json!({"from": self.name.clone()})))
            }
        }
    }

    fn fast_executor() -> ReliableToolExecutor {
        let config = OrchestratorReliabilityConfig {
            retry_policy: RetryPolicy {
                initial_delay: 0.01,
                max_delay: 0.05,
                ..RetryPolicy::default()
            },
            ..OrchestratorReliabilityConfig::default()
        };
        ReliableToolExecutor::new(config)
    }

    #[tokio::test]
    async fn primary_retries_then_succeeds() {
        let executor = fast_executor();
        let tool = FlakyTool::new("primary", 2, true);
        let result = executor
            .execute_with_reliability(tool.clone(), &json!({}), &Map::new(), None, &[])
            .await
            .unwrap();
        match result {
            ToolResult::Plain(v) => assert_eq!(v["from"], "primary"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tool.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn falls_back_when_primary_exhausted() {
        let executor = fast_executor();
        let primary = FlakyTool::new("primary", 99, true);
        let backup = FlakyTool::new("backup", 0, true);
        let fallbacks: Vec<Arc<dyn Tool>> = vec![backup.clone()];
        let result = executor
            .execute_with_reliability(primary, &json!({}), &Map::new(), None, &fallbacks)
            .await
            .unwrap();
        match result {
            ToolResult::Plain(v) => assert_eq!(v["from"], "backup"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_retryable_without_fallback_surfaces() {
        let executor = fast_executor();
        let tool = FlakyTool::new("primary", 99, false);
        let err = executor
            .execute_with_reliability(tool.clone(), &json!({}), &Map::new(), None, &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSIENT");
        // No retries for non-retryable failures.
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_failures_produce_aggregate_error() {
        let executor = fast_executor();
        let primary = FlakyTool::new("primary", 99, true);
        let backup = FlakyTool::new("backup", 99, true);
        let fallbacks: Vec<Arc<dyn Tool>> = vec![backup];
        let err = executor
            .execute_with_reliability(primary, &json!({}), &Map::new(), None, &fallbacks)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALL_TOOLS_FAILED");
    }

    #[tokio::test]
    async fn breaker_states_exposed() {
        let executor = fast_executor();
        let tool = FlakyTool::new("primary", 0, true);
        executor
            .execute_with_reliability(tool, &json!({}), &Map::new(), None, &[])
            .await
            .unwrap();
        let states = executor.breaker_states().await;
        assert_eq!(states["default:primary"], "closed");
    }
}
