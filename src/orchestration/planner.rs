//! Tool selection planning.
//!
//! The rule-based planner evaluates prioritized rules against the request;
//! the first match whose tool is neither circuit-broken nor unavailable
//! wins. With no matching rule it falls back to the first viable tool with
//! conservative defaults.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};

use super::errors::OrchestrationError;

/// Metadata about a registered tool, as seen by planners.
#[derive(Debug, Clone, Default)]
pub struct ToolMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub default_options: Map<String, Value>,
}

/// Context available while planning.
#[derive(Debug, Clone, Default)]
pub struct PlanningContext {
    pub budget: Option<Value>,
    pub quality_requirements: Option<Value>,
    /// Breaker key → state string ("open", "closed", "half_open").
    pub circuit_breaker_states: HashMap<String, String>,
}

impl PlanningContext {
    fn is_open(&self, tool_name: &str) -> bool {
        self.circuit_breaker_states
            .iter()
            .any(|(key, state)| state == "open" && (key == tool_name || key.ends_with(&format!(":{}", tool_name))))
    }
}

/// Planning outcome.
#[derive(Debug, Clone)]
pub struct PlanDecision {
    pub selected_tool: String,
    pub tool_options: Map<String, Value>,
    pub fallback_tools: Vec<String>,
    pub estimated_cost: Option<f64>,
    pub estimated_duration_ms: Option<u64>,
    pub confidence: f64,
    pub reasoning: Option<String>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        request: &Value,
        available_tools: &HashMap<String, ToolMetadata>,
        context: &PlanningContext,
    ) -> Result<PlanDecision, OrchestrationError>;
}

/// Condition operator over a dotted attribute path.
#[derive(Clone)]
pub enum ConditionOp {
    Equals(Value),
    Contains(String),
    Regex(String),
    Exists,
    Gt(f64),
    Lt(f64),
    Custom(Arc<dyn Fn(Option<&Value>) -> bool + Send + Sync>),
}

/// A single rule condition.
#[derive(Clone)]
pub struct RuleCondition {
    pub attribute_path: String,
    pub op: ConditionOp,
}

impl RuleCondition {
    pub fn new(attribute_path: impl Into<String>, op: ConditionOp) -> Self {
        Self {
            attribute_path: attribute_path.into(),
            op,
        }
    }

    fn lookup<'a>(&self, request: &'a Value) -> Option<&'a Value> {
        let mut current = request;
        for part in self.attribute_path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn matches(&self, request: &Value) -> bool {
        let value = self.lookup(request);
        if let ConditionOp::Custom(matcher) = &self.op {
            return matcher(value);
        }
        if matches!(&self.op, ConditionOp::Exists) {
            return value.is_some();
        }
        let Some(value) = value else {
            return false;
        };
        match &self.op {
            ConditionOp::Equals(expected) => value == expected,
            ConditionOp::Contains(needle) => value_to_string(value).contains(needle),
            ConditionOp::Regex(pattern) => Regex::new(pattern)
                .map(|re| re.is_match(&value_to_string(value)))
                .unwrap_or(false),
            ConditionOp::Gt(threshold) => value.as_f64().is_some_and(|v| v > *threshold),
            ConditionOp::Lt(threshold) => value.as_f64().is_some_and(|v| v < *threshold),
            ConditionOp::Exists | ConditionOp::Custom(_) => unreachable!(),
        }
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Transformer rewriting tool options based on the request.
pub type OptionTransformer = Arc<dyn Fn(&Value) -> Map<String, Value> + Send + Sync>;

/// Action taken when a rule matches.
#[derive(Clone)]
pub struct RuleAction {
    pub tool_name: String,
    pub tool_options: Map<String, Value>,
    pub fallback_tools: Vec<String>,
    pub option_transformer: Option<OptionTransformer>,
}

impl RuleAction {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_options: Map::new(),
            fallback_tools: Vec::new(),
            option_transformer: None,
        }
    }

    fn options_for(&self, request: &Value) -> Map<String, Value> {
        match &self.option_transformer {
            Some(transform) => transform(request),
            None => self.tool_options.clone(),
        }
    }
}

/// A prioritized planning rule; all conditions must match.
#[derive(Clone)]
pub struct PlanningRule {
    pub name: String,
    pub priority: i32,
    pub conditions: Vec<RuleCondition>,
    pub action: RuleAction,
}

impl PlanningRule {
    pub fn matches(&self, request: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(request))
    }
}

/// Rule helper: match on `type == <request_type>`.
pub fn type_based_rule(request_type: &str, tool_name: &str, priority: i32) -> PlanningRule {
    PlanningRule {
        name: format!("type_{}", request_type),
        priority,
        conditions: vec![RuleCondition::new(
            "type",
            ConditionOp::Equals(json!(request_type)),
        )],
        action: RuleAction::new(tool_name),
    }
}

/// Rule helper: match when any keyword appears in the attribute.
pub fn keyword_based_rule(
    keywords: Vec<String>,
    attribute: &str,
    tool_name: &str,
    priority: i32,
) -> PlanningRule {
    let matcher: Arc<dyn Fn(Option<&Value>) -> bool + Send + Sync> = Arc::new(move |value| {
        let Some(value) = value else { return false };
        let haystack = value_to_string(value).to_lowercase();
        keywords.iter().any(|k| haystack.contains(&k.to_lowercase()))
    });
    PlanningRule {
        name: format!("keywords_{}", tool_name),
        priority,
        conditions: vec![RuleCondition::new(attribute, ConditionOp::Custom(matcher))],
        action: RuleAction::new(tool_name),
    }
}

/// Rule helper: always matches, choosing replicate count by budget.
pub fn budget_aware_rule(
    tool_name: &str,
    low_budget_k: u64,
    high_budget_k: u64,
    priority: i32,
) -> PlanningRule {
    let transform: OptionTransformer = Arc::new(move |request| {
        let budget = request.pointer("/options/budget");
        let tight = budget.is_some_and(|b| {
            b.get("tokens").and_then(Value::as_u64).is_some_and(|t| t < 2000)
                || b.get("cost_usd")
                    .and_then(Value::as_f64)
                    .is_some_and(|c| c < 0.10)
        });
        let mut options = Map::new();
        options.insert(
            "k".into(),
            json!(if tight { low_budget_k } else { high_budget_k }),
        );
        options
    });
    PlanningRule {
        name: format!("budget_aware_{}", tool_name),
        priority,
        conditions: Vec::new(),
        action: RuleAction {
            option_transformer: Some(transform),
            ..RuleAction::new(tool_name)
        },
    }
}

/// Planner evaluating prioritized rules, with a conservative default.
#[derive(Default)]
pub struct RuleBasedPlanner {
    rules: Vec<PlanningRule>,
}

impl RuleBasedPlanner {
    pub fn new(mut rules: Vec<PlanningRule>) -> Self {
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        Self { rules }
    }

    pub fn add_rule(&mut self, rule: PlanningRule) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
    }

    fn default_plan(
        &self,
        available_tools: &HashMap<String, ToolMetadata>,
        context: &PlanningContext,
    ) -> Result<PlanDecision, OrchestrationError> {
        if available_tools.is_empty() {
            return Err(OrchestrationError::orchestrator(
                "no tools available for planning",
                "NO_TOOLS",
            ));
        }
        let mut names: Vec<&String> = available_tools.keys().collect();
        names.sort();
        let mut viable: Vec<&String> = names
            .iter()
            .copied()
            .filter(|name| !context.is_open(name))
            .collect();
        if viable.is_empty() {
            // Everything is circuit-broken; attempt anyway.
            viable = names;
        }

        let selected = viable[0].clone();
        let metadata = &available_tools[&selected];
        let mut options = metadata.default_options.clone();
        let budget_tight = context.budget.as_ref().is_some_and(|b| {
            b.get("tokens").and_then(Value::as_u64).is_some_and(|t| t < 1000)
                || b.get("cost_usd")
                    .and_then(Value::as_f64)
                    .is_some_and(|c| c < 0.05)
        });
        options.insert("k".into(), json!(if budget_tight { 2 } else { 3 }));
        options.entry("epsilon".to_string()).or_insert(json!(0.2));
        options
            .entry("max_parallel".to_string())
            .or_insert(json!(10));

        Ok(PlanDecision {
            selected_tool: selected,
            tool_options: options,
            fallback_tools: viable.iter().skip(1).take(2).map(|s| (*s).clone()).collect(),
            estimated_cost: None,
            estimated_duration_ms: None,
            confidence: 0.5,
            reasoning: Some("no matching rules, using default selection".to_string()),
        })
    }
}

#[async_trait]
impl Planner for RuleBasedPlanner {
    async fn plan(
        &self,
        request: &Value,
        available_tools: &HashMap<String, ToolMetadata>,
        context: &PlanningContext,
    ) -> Result<PlanDecision, OrchestrationError> {
        for rule in &self.rules {
            if !rule.matches(request) {
                continue;
            }
            // Circuit-broken primaries are skipped, then fallbacks tried.
            let mut candidates = vec![rule.action.tool_name.clone()];
            candidates.extend(rule.action.fallback_tools.iter().cloned());
            let selected = candidates.iter().find(|name| {
                available_tools.contains_key(*name) && !context.is_open(name)
            });
            let Some(selected) = selected else {
                continue;
            };

            let metadata = &available_tools[selected];
            let mut options = metadata.default_options.clone();
            for (key, value) in rule.action.options_for(request) {
                options.insert(key, value);
            }
            return Ok(PlanDecision {
                selected_tool: selected.clone(),
                tool_options: options,
                fallback_tools: rule.action.fallback_tools.clone(),
                estimated_cost: None,
                estimated_duration_ms: None,
                confidence: 1.0,
                reasoning: Some(format!("matched rule: {}", rule.name)),
            });
        }
        self.default_plan(available_tools, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools(names: &[&str]) -> HashMap<String, ToolMetadata> {
        names
            .iter()
            .map(|name| {
                (
                    (*name).to_string(),
                    ToolMetadata {
                        name: (*name).to_string(),
                        version: "1.0.0".into(),
                        ..ToolMetadata::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn condition_operators() {
        let request = json!({"type": "scoring", "metadata": {"domain": "finance"}, "score": 7});
        assert!(RuleCondition::new("type", ConditionOp::Equals(json!("scoring"))).matches(&request));
        assert!(RuleCondition::new("metadata.domain", ConditionOp::Contains("fin".into())).matches(&request));
        assert!(RuleCondition::new("metadata.domain", ConditionOp::Regex("^fin".into())).matches(&request));
        assert!(RuleCondition::new("score", ConditionOp::Gt(5.0)).matches(&request));
        assert!(!RuleCondition::new("score", ConditionOp::Lt(5.0)).matches(&request));
        assert!(RuleCondition::new("metadata", ConditionOp::Exists).matches(&request));
        assert!(!RuleCondition::new("missing.path", ConditionOp::Exists).matches(&request));
    }

    #[tokio::test]
    async fn matching_rule_selects_tool() {
        let planner = RuleBasedPlanner::new(vec![type_based_rule("scoring", "score_bundle", 10)]);
        let decision = planner
            .plan(
                &json!({"type": "scoring"}),
                &tools(&["score_bundle", "other"]),
                &PlanningContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.selected_tool, "score_bundle");
        assert!((decision.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn higher_priority_rule_wins() {
        let planner = RuleBasedPlanner::new(vec![
            type_based_rule("scoring", "low_priority", 1),
            type_based_rule("scoring", "high_priority", 10),
        ]);
        let decision = planner
            .plan(
                &json!({"type": "scoring"}),
                &tools(&["low_priority", "high_priority"]),
                &PlanningContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.selected_tool, "high_priority");
    }

    #[tokio::test]
    async fn circuit_broken_primary_falls_back() {
        let mut rule = type_based_rule("scoring", "primary", 10);
        rule.action.fallback_tools = vec!["backup".to_string()];
        let planner = RuleBasedPlanner::new(vec![rule]);
        let mut context = PlanningContext::default();
        context
            .circuit_breaker_states
            .insert("openai:primary".into(), "open".into());
        let decision = planner
            .plan(
                &json!({"type": "scoring"}),
                &tools(&["primary", "backup"]),
                &context,
            )
            .await
            .unwrap();
        assert_eq!(decision.selected_tool, "backup");
    }

    #[tokio::test]
    async fn default_plan_uses_conservative_options() {
        let planner = RuleBasedPlanner::default();
        let decision = planner
            .plan(
                &json!({"query": "anything"}),
                &tools(&["bundle_a", "bundle_b"]),
                &PlanningContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.selected_tool, "bundle_a");
        assert_eq!(decision.tool_options["k"], json!(3));
        assert_eq!(decision.tool_options["epsilon"], json!(0.2));
        assert_eq!(decision.fallback_tools, vec!["bundle_b"]);
        assert!((decision.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn tight_budget_lowers_replicates() {
        let planner = RuleBasedPlanner::default();
        let context = PlanningContext {
            budget: Some(json!({"tokens": 500})),
            ..PlanningContext::default()
        };
        let decision = planner
            .plan(&json!({}), &tools(&["bundle"]), &context)
            .await
            .unwrap();
        assert_eq!(decision.tool_options["k"], json!(2));
    }

    #[tokio::test]
    async fn keyword_rule_matches_any_keyword() {
        let rule = keyword_based_rule(
            vec!["feasibility".into(), "viable".into()],
            "query",
            "feasibility_bundle",
            5,
        );
        let planner = RuleBasedPlanner::new(vec![rule]);
        let decision = planner
            .plan(
                &json!({"query": "Is this plan VIABLE long-term?"}),
                &tools(&["feasibility_bundle"]),
                &PlanningContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.selected_tool, "feasibility_bundle");
    }

    #[tokio::test]
    async fn budget_aware_rule_transforms_options() {
        let rule = budget_aware_rule("bundle", 2, 5, 8);
        let planner = RuleBasedPlanner::new(vec![rule]);
        let decision = planner
            .plan(
                &json!({"options": {"budget": {"tokens": 100}}}),
                &tools(&["bundle"]),
                &PlanningContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.tool_options["k"], json!(2));
    }

    #[tokio::test]
    async fn no_tools_is_an_error() {
        let planner = RuleBasedPlanner::default();
        let err = planner
            .plan(&json!({}), &HashMap::new(), &PlanningContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_TOOLS");
    }
}
