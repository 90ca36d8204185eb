//! Orchestrator options and budgets.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Resource budget across an orchestrated run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub ms: Option<u64>,
}

impl Budget {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_none() && self.cost_usd.is_none() && self.ms.is_none()
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(tokens) = self.tokens {
            map.insert("tokens".into(), json!(tokens));
        }
        if let Some(cost) = self.cost_usd {
            map.insert("cost_usd".into(), json!(cost));
        }
        if let Some(ms) = self.ms {
            map.insert("ms".into(), json!(ms));
        }
        Value::Object(map)
    }
}

/// Callback for redacting sensitive data from event metadata.
pub type Redactor = Arc<dyn Fn(Map<String, Value>) -> Map<String, Value> + Send + Sync>;

/// Options for one orchestrator run.
#[derive(Clone, Default)]
pub struct OrchestratorOptions {
    /// Maximum sub-tasks in flight (1..=20; tools clamp further).
    pub max_parallel: Option<usize>,
    pub budget: Option<Budget>,
    pub timeout_ms: Option<u64>,
    pub streaming: bool,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub idempotency_key: Option<String>,
    /// Quality requirements consulted by the planner.
    pub quality_requirements: Option<Value>,
    pub redactor: Option<Redactor>,
}

impl OrchestratorOptions {
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}
