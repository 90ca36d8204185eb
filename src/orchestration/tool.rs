//! Tool interface and registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use super::bundle::EvidenceBundle;
use super::errors::OrchestrationError;
use super::events::OrchestratorEvents;
use super::planner::ToolMetadata;
use crate::normalize::usage::Usage;

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub enum ToolResult {
    /// A bundle tool's evidence bundle.
    Bundle(Box<EvidenceBundle>),
    /// A structured result with optional accounting.
    Structured {
        content: Value,
        usage: Option<Usage>,
        cost_usd: Option<f64>,
        metadata: Map<String, Value>,
    },
    /// A plain value.
    Plain(Value),
}

/// An orchestratable operation. Tools handle their own parallelism,
/// validation, and aggregation.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool.
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        ""
    }

    /// Provider this tool runs against, used for circuit-breaker keying.
    fn provider_hint(&self) -> Option<&str> {
        None
    }

    fn default_options(&self) -> Map<String, Value> {
        Map::new()
    }

    async fn execute(
        &self,
        request: &Value,
        options: &Map<String, Value>,
        events: Option<&OrchestratorEvents>,
    ) -> Result<ToolResult, OrchestrationError>;
}

/// Single-writer name→tool map. Duplicate names are rejected with version
/// diagnostics.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Mutex<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), OrchestrationError> {
        let mut tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = tools.get(tool.name()) {
            return Err(OrchestrationError::orchestrator(
                format!(
                    "Tool '{}' already registered. Existing version: {}, new version: {}",
                    tool.name(),
                    existing.version(),
                    tool.version()
                ),
                "DUPLICATE_TOOL",
            ));
        }
        info!(tool = tool.name(), version = tool.version(), "registered tool");
        tools.insert(tool.name().to_string(), tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Metadata snapshot for the planner.
    pub fn metadata(&self) -> HashMap<String, ToolMetadata> {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        tools
            .iter()
            .map(|(name, tool)| {
                (
                    name.clone(),
                    ToolMetadata {
                        name: name.clone(),
                        version: tool.version().to_string(),
                        description: tool.description().to_string(),
                        default_options: tool.default_options(),
                    },
                )
            })
            .collect()
    }

    /// Test hook: drop every registration.
    pub fn clear(&self) {
        let mut tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        tools.clear();
    }
}
