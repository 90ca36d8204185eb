//! Orchestrator: executes registered tools with events, budgets, and (in the
//! enhanced path) planning, idempotency, and reliable execution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;
use uuid::Uuid;

use super::bundle::EvidenceBundle;
use super::errors::{BudgetKind, OrchestrationError};
use super::events::OrchestratorEvents;
use super::executor::{OrchestratorReliabilityConfig, ReliableToolExecutor};
use super::options::{Budget, OrchestratorOptions};
use super::planner::{Planner, PlanningContext, RuleBasedPlanner};
use super::tool::{Tool, ToolRegistry, ToolResult};
use crate::normalize::usage::Usage;
use crate::reliability::idempotency::IdempotencyCache;
use crate::streaming::manager::EventManager;

/// Result of an orchestrated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResult {
    pub content: Value,
    pub usage: Usage,
    pub cost_usd: Option<f64>,
    pub elapsed_ms: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Value>,
    pub metadata: Map<String, Value>,
}

fn extract_result(result: ToolResult) -> (Value, Usage, Option<f64>, Map<String, Value>) {
    match result {
        ToolResult::Bundle(bundle) => {
            let EvidenceBundle {
                meta,
                replicates,
                summary,
                usage_total,
                cost_total_usd,
                metadata,
                ..
            } = *bundle;
            let mut extra = Map::new();
            extra.insert("replicate_count".into(), json!(replicates.len()));
            extra.insert("confidence".into(), json!(summary.confidence));
            extra.insert("early_stopped".into(), json!(meta.early_stopped));
            if let Some(metadata) = metadata {
                extra.extend(metadata);
            }
            let content = json!({
                "evidence_bundle": {
                    "meta": meta,
                    "replicates": replicates,
                    "summary": summary,
                }
            });
            (content, usage_total.unwrap_or_default(), cost_total_usd, extra)
        }
        ToolResult::Structured {
            content,
            usage,
            cost_usd,
            metadata,
        } => (content, usage.unwrap_or_default(), cost_usd, metadata),
        ToolResult::Plain(value) => {
            let content = match value {
                Value::String(s) => Value::String(s),
                other => Value::String(other.to_string()),
            };
            (content, Usage::default(), None, Map::new())
        }
    }
}

fn check_budget(
    budget: &Budget,
    usage: &Usage,
    cost: Option<f64>,
    started: Instant,
) -> Result<(), OrchestrationError> {
    if let Some(ms) = budget.ms {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > ms {
            return Err(OrchestrationError::BudgetExceeded {
                kind: BudgetKind::Time,
                limit: ms as f64,
                actual: elapsed_ms as f64,
            });
        }
    }
    if let Some(tokens) = budget.tokens {
        if usage.total_tokens > tokens {
            return Err(OrchestrationError::BudgetExceeded {
                kind: BudgetKind::Tokens,
                limit: tokens as f64,
                actual: usage.total_tokens as f64,
            });
        }
    }
    if let (Some(limit), Some(cost)) = (budget.cost_usd, cost) {
        if cost > limit {
            return Err(OrchestrationError::BudgetExceeded {
                kind: BudgetKind::Cost,
                limit,
                actual: cost,
            });
        }
    }
    Ok(())
}

fn merge_tool_options(
    tool_options: Option<&Map<String, Value>>,
    options: &OrchestratorOptions,
) -> Map<String, Value> {
    let mut merged = tool_options.cloned().unwrap_or_default();
    if let Some(max_parallel) = options.max_parallel {
        merged.insert("max_parallel".into(), json!(max_parallel));
    }
    if let Some(trace_id) = &options.trace_id {
        merged.insert("trace_id".into(), json!(trace_id));
    }
    if let Some(request_id) = &options.request_id {
        merged.insert("request_id".into(), json!(request_id));
    }
    if let Some(budget) = &options.budget {
        if !budget.is_empty() {
            merged.insert("global_budget".into(), budget.to_value());
        }
    }
    if let Some(timeout_ms) = options.timeout_ms {
        merged.insert("timeout_ms".into(), json!(timeout_ms));
    }
    merged
}

/// Executes named tools with events and budget enforcement. Planning,
/// idempotency and reliability ride on top via [`Orchestrator::run_planned`].
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    planner: Box<dyn Planner>,
    executor: ReliableToolExecutor,
    idempotency: IdempotencyCache,
}

impl Orchestrator {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            planner: Box::new(RuleBasedPlanner::default()),
            executor: ReliableToolExecutor::new(OrchestratorReliabilityConfig::default()),
            idempotency: IdempotencyCache::default(),
        }
    }

    pub fn with_planner(mut self, planner: Box<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_reliability(mut self, config: OrchestratorReliabilityConfig) -> Self {
        self.executor = ReliableToolExecutor::new(config);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Register a tool on this orchestrator's registry.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<(), OrchestrationError> {
        self.registry.register(tool)
    }

    fn tool_events(
        &self,
        events: Option<&Arc<EventManager>>,
        options: &OrchestratorOptions,
        tool_name: &str,
    ) -> Option<OrchestratorEvents> {
        if !options.streaming {
            return None;
        }
        events.map(|manager| {
            OrchestratorEvents::new(manager.clone(), tool_name)
                .for_bundle()
                .with_redactor(options.redactor.clone())
        })
    }

    async fn execute_tool(
        &self,
        tool: &Arc<dyn Tool>,
        request: &Value,
        merged_options: &Map<String, Value>,
        orch_events: Option<&OrchestratorEvents>,
        options: &OrchestratorOptions,
        started: Instant,
        fallbacks: &[Arc<dyn Tool>],
    ) -> Result<ToolResult, OrchestrationError> {
        let run = self.executor.execute_with_reliability(
            tool.clone(),
            request,
            merged_options,
            orch_events,
            fallbacks,
        );
        match options.timeout_ms {
            Some(timeout_ms) => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
                    Ok(result) => result,
                    Err(_) => Err(OrchestrationError::BudgetExceeded {
                        kind: BudgetKind::Time,
                        limit: timeout_ms as f64,
                        actual: started.elapsed().as_millis() as f64,
                    }),
                }
            }
            None => run.await,
        }
    }

    fn build_result(
        &self,
        tool: &Arc<dyn Tool>,
        tool_result: ToolResult,
        options: &OrchestratorOptions,
        started: Instant,
    ) -> Result<OrchestratorResult, OrchestrationError> {
        let (content, usage, cost, extra) = extract_result(tool_result);

        if let Some(budget) = &options.budget {
            check_budget(budget, &usage, cost, started)?;
        }

        let mut metadata = Map::new();
        metadata.insert("tool_name".into(), json!(tool.name()));
        metadata.insert("tool_version".into(), json!(tool.version()));
        if let Some(trace_id) = &options.trace_id {
            metadata.insert("trace_id".into(), json!(trace_id));
        }
        if let Some(request_id) = &options.request_id {
            metadata.insert("request_id".into(), json!(request_id));
        }
        if let Some(budget) = &options.budget {
            metadata.insert("budget".into(), budget.to_value());
        }
        metadata.extend(extra);

        Ok(OrchestratorResult {
            content,
            usage,
            cost_usd: cost,
            elapsed_ms: started.elapsed().as_millis() as u64,
            status: "succeeded".to_string(),
            errors: None,
            metadata,
        })
    }

    fn failed_result(
        &self,
        tool: &Arc<dyn Tool>,
        error: &OrchestrationError,
        options: &OrchestratorOptions,
        started: Instant,
    ) -> OrchestratorResult {
        let error_info = json!({
            "type": error.code(),
            "message": error.to_string(),
            "is_retryable": error.is_retryable(),
        });
        let mut metadata = Map::new();
        metadata.insert("tool_name".into(), json!(tool.name()));
        metadata.insert("tool_version".into(), json!(tool.version()));
        if let Some(trace_id) = &options.trace_id {
            metadata.insert("trace_id".into(), json!(trace_id));
        }
        OrchestratorResult {
            content: json!({"error": error_info}),
            usage: Usage::default(),
            cost_usd: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
            status: "failed".to_string(),
            errors: Some(json!({ (tool.name()): error_info })),
            metadata,
        }
    }

    /// Execute a named tool.
    ///
    /// Tool failures are packaged into a failed `OrchestratorResult`;
    /// `BudgetExceeded` and idempotency conflicts are raised.
    pub async fn run(
        &self,
        request: &Value,
        tool_name: &str,
        tool_options: Option<&Map<String, Value>>,
        options: &OrchestratorOptions,
        events: Option<&Arc<EventManager>>,
    ) -> Result<OrchestratorResult, OrchestrationError> {
        let started = Instant::now();
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| OrchestrationError::ToolNotFound(tool_name.to_string()))?;

        let merged = merge_tool_options(tool_options, options);
        let orch_events = self.tool_events(events, options, tool_name);
        if let Some(orch_events) = &orch_events {
            orch_events.emit_start(options.request_id.as_deref()).await;
        }

        let outcome = self
            .execute_tool(&tool, request, &merged, orch_events.as_ref(), options, started, &[])
            .await;

        match outcome {
            Ok(tool_result) => {
                let result = self.build_result(&tool, tool_result, options, started)?;
                if let Some(orch_events) = &orch_events {
                    orch_events
                        .emit_complete(0, started.elapsed().as_secs_f64() * 1000.0)
                        .await;
                }
                Ok(result)
            }
            Err(error @ OrchestrationError::BudgetExceeded { .. }) => Err(error),
            Err(error @ OrchestrationError::Conflict { .. }) => Err(error),
            Err(error) => {
                if let Some(orch_events) = &orch_events {
                    orch_events
                        .emit_error(&error.to_string(), error.is_retryable())
                        .await;
                }
                Ok(self.failed_result(&tool, &error, options, started))
            }
        }
    }

    /// Execute with automatic tool selection, idempotency, and fallbacks.
    ///
    /// When `tool_name` is `None` the planner chooses the tool and its
    /// options; an `idempotency_key` short-circuits to the cached result
    /// when the request matches (and conflicts when it does not).
    pub async fn run_planned(
        &self,
        request: &Value,
        tool_name: Option<&str>,
        tool_options: Option<&Map<String, Value>>,
        options: &OrchestratorOptions,
        events: Option<&Arc<EventManager>>,
    ) -> Result<OrchestratorResult, OrchestrationError> {
        let started = Instant::now();
        let mut options = options.clone();
        if options.request_id.is_none() {
            options.request_id = Some(Uuid::new_v4().to_string());
        }
        if options.trace_id.is_none() {
            options.trace_id.clone_from(&options.request_id);
        }

        if let Some(key) = &options.idempotency_key {
            if let Some(cached) = self.idempotency.get(key) {
                if cached.get("request") != Some(request) {
                    return Err(OrchestrationError::conflict(key.clone()));
                }
                if let Some(result) = cached.get("result") {
                    match serde_json::from_value::<OrchestratorResult>(result.clone()) {
                        Ok(result) => return Ok(result),
                        Err(e) => warn!("discarding unreadable idempotency entry: {}", e),
                    }
                }
            }
        }

        let (tool, merged, fallbacks) = match tool_name {
            Some(name) => {
                let tool = self
                    .registry
                    .get(name)
                    .ok_or_else(|| OrchestrationError::ToolNotFound(name.to_string()))?;
                (tool, merge_tool_options(tool_options, &options), Vec::new())
            }
            None => {
                let context = PlanningContext {
                    budget: options.budget.as_ref().map(Budget::to_value),
                    quality_requirements: options.quality_requirements.clone(),
                    circuit_breaker_states: self.executor.breaker_states().await,
                };
                let decision = self
                    .planner
                    .plan(request, &self.registry.metadata(), &context)
                    .await?;
                let tool = self
                    .registry
                    .get(&decision.selected_tool)
                    .ok_or_else(|| OrchestrationError::ToolNotFound(decision.selected_tool.clone()))?;
                let mut planned = decision.tool_options.clone();
                if let Some(extra) = tool_options {
                    planned.extend(extra.clone());
                }
                let merged = merge_tool_options(Some(&planned), &options);
                let fallbacks: Vec<Arc<dyn Tool>> = decision
                    .fallback_tools
                    .iter()
                    .filter_map(|name| self.registry.get(name))
                    .collect();
                (tool, merged, fallbacks)
            }
        };

        let orch_events = self.tool_events(events, &options, tool.name());
        if let Some(orch_events) = &orch_events {
            orch_events.emit_start(options.request_id.as_deref()).await;
        }

        let outcome = self
            .execute_tool(
                &tool,
                request,
                &merged,
                orch_events.as_ref(),
                &options,
                started,
                &fallbacks,
            )
            .await;

        let result = match outcome {
            Ok(tool_result) => {
                let result = self.build_result(&tool, tool_result, &options, started)?;
                if let Some(orch_events) = &orch_events {
                    orch_events
                        .emit_complete(0, started.elapsed().as_secs_f64() * 1000.0)
                        .await;
                }
                result
            }
            Err(error @ OrchestrationError::BudgetExceeded { .. }) => return Err(error),
            Err(error @ OrchestrationError::Conflict { .. }) => return Err(error),
            Err(error) => {
                if let Some(orch_events) = &orch_events {
                    orch_events
                        .emit_error(&error.to_string(), error.is_retryable())
                        .await;
                }
                self.failed_result(&tool, &error, &options, started)
            }
        };

        if let Some(key) = &options.idempotency_key {
            if result.status == "succeeded" {
                match serde_json::to_value(&result) {
                    Ok(serialized) => self.idempotency.store(
                        key.clone(),
                        json!({"request": request, "result": serialized}),
                    ),
                    Err(e) => warn!("failed to serialize result for idempotency cache: {}", e),
                }
            }
        }

        Ok(result)
    }
}
