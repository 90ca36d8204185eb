//! Bundle execution: K replicates in parallel, schema validation, and a
//! statistical summary over the results.
//!
//! The consensus/distance defaults here are deliberately simple (field-wise
//! equality, 0/1 distance); host tools with domain metrics override
//! `summarize` while keeping the bundle shape.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use super::errors::OrchestrationError;
use super::events::OrchestratorEvents;
use crate::normalize::usage::Usage;

const DEFAULT_SEEDS: [i64; 10] = [11, 23, 47, 59, 71, 83, 97, 113, 127, 139];

/// Options for a bundle run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleOptions {
    pub k: u32,
    pub seeds: Option<Vec<i64>>,
    pub epsilon: f64,
    pub schema_uri: Option<String>,
    /// Inline JSON schema used to validate replicate outputs.
    pub schema: Option<Value>,
    pub per_replicate_budget: Option<Value>,
    pub global_budget: Option<Value>,
    pub bundle_limits: Option<Value>,
    pub max_parallel: u32,
    pub timeout_ms: Option<u64>,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            k: 3,
            seeds: None,
            epsilon: 0.2,
            schema_uri: None,
            schema: None,
            per_replicate_budget: None,
            global_budget: None,
            bundle_limits: None,
            max_parallel: 10,
            timeout_ms: None,
            trace_id: None,
            request_id: None,
        }
    }
}

impl BundleOptions {
    /// Parse from a loose options map, clamping to legal ranges.
    pub fn from_map(options: &Map<String, Value>) -> Self {
        let mut parsed: Self =
            serde_json::from_value(Value::Object(options.clone())).unwrap_or_default();
        parsed.k = parsed.k.clamp(2, 10);
        parsed.epsilon = parsed.epsilon.clamp(0.0, 1.0);
        parsed.max_parallel = parsed.max_parallel.clamp(1, 20);
        parsed
    }

    /// Seeds for the run: explicit, or the stable default sequence.
    pub fn effective_seeds(&self) -> Vec<i64> {
        match &self.seeds {
            Some(seeds) if seeds.len() >= self.k as usize => seeds[..self.k as usize].to_vec(),
            _ => DEFAULT_SEEDS[..self.k as usize].to_vec(),
        }
    }
}

/// Quality assessment for one replicate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicateQuality {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

/// A single replicate result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replicate {
    pub id: String,
    pub data: Value,
    pub quality: ReplicateQuality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A field where replicates disagreed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disagreement {
    pub field: String,
    pub values: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicate_ids: Option<Vec<String>>,
}

/// Statistical summary across replicates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus: Option<Value>,
    pub disagreements: Vec<Disagreement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairwise_distance: Option<Vec<Vec<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distributions: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation_info: Option<Value>,
}

/// Metadata about the bundle run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    pub task: String,
    pub k: u32,
    pub k_completed: u32,
    pub model: String,
    pub seeds: Vec<i64>,
    pub early_stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_stop_reason: Option<String>,
    pub total_elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_uri: Option<String>,
}

/// Replicates plus summary, as returned by bundle tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub meta: BundleMeta,
    pub replicates: Vec<Replicate>,
    pub summary: BundleSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_total: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_total_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_breakdown: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Output of one replicate execution.
#[derive(Debug, Clone)]
pub struct ReplicateOutput {
    pub data: Value,
    pub usage: Option<Usage>,
    pub cost_usd: Option<f64>,
    pub model: Option<String>,
}

/// Runs one replicate of the underlying sub-agent. The seed is the
/// replicate's deterministic seed.
#[async_trait]
pub trait ReplicateRunner: Send + Sync {
    async fn run_replicate(
        &self,
        request: &Value,
        seed: i64,
        options: &BundleOptions,
    ) -> Result<ReplicateOutput, OrchestrationError>;

    /// Whether the bundle may cancel outstanding replicates once agreement
    /// is reached.
    fn supports_early_stop(&self) -> bool {
        true
    }
}

fn validate_against_schema(data: &Value, schema: &Value) -> Vec<String> {
    match jsonschema::validator_for(schema) {
        Ok(validator) => validator
            .iter_errors(data)
            .map(|e| format!("{} at {}", e, e.instance_path()))
            .collect(),
        Err(e) => {
            warn!("invalid bundle schema, skipping validation: {}", e);
            Vec::new()
        }
    }
}

/// 0/1 distance between two replicate outputs.
fn simple_distance(a: &Value, b: &Value) -> f64 {
    if a == b { 0.0 } else { 1.0 }
}

/// Field-wise consensus and disagreements over valid JSON-object outputs;
/// non-object outputs are compared as whole values under the `content`
/// field.
fn compute_summary(replicates: &[Replicate]) -> BundleSummary {
    let valid: Vec<&Replicate> = replicates.iter().filter(|r| r.quality.valid).collect();

    let mut consensus: Option<Value> = None;
    let mut disagreements = Vec::new();

    if valid.len() >= 2 && valid.iter().all(|r| r.data.is_object()) {
        let mut keys: BTreeMap<String, Vec<(&str, &Value)>> = BTreeMap::new();
        for replicate in &valid {
            if let Value::Object(fields) = &replicate.data {
                for (key, value) in fields {
                    keys.entry(key.clone())
                        .or_default()
                        .push((replicate.id.as_str(), value));
                }
            }
        }
        let mut consensus_fields = Map::new();
        for (field, values) in keys {
            let all_present = values.len() == valid.len();
            let first = values[0].1;
            if all_present && values.iter().all(|(_, v)| *v == first) {
                consensus_fields.insert(field, first.clone());
            } else {
                let mut unique = Vec::new();
                for (_, value) in &values {
                    if !unique.contains(*value) {
                        unique.push((*value).clone());
                    }
                }
                disagreements.push(Disagreement {
                    field,
                    values: unique,
                    replicate_ids: Some(values.iter().map(|(id, _)| (*id).to_string()).collect()),
                });
            }
        }
        if !consensus_fields.is_empty() && disagreements.is_empty() {
            consensus = Some(Value::Object(consensus_fields));
        }
    } else if valid.len() >= 2 {
        let first = &valid[0].data;
        if valid.iter().all(|r| &r.data == first) {
            consensus = Some(first.clone());
        } else {
            let mut unique = Vec::new();
            for replicate in &valid {
                if !unique.contains(&replicate.data) {
                    unique.push(replicate.data.clone());
                }
            }
            disagreements.push(Disagreement {
                field: "content".to_string(),
                values: unique,
                replicate_ids: Some(valid.iter().map(|r| r.id.clone()).collect()),
            });
        }
    } else if valid.len() == 1 {
        consensus = Some(valid[0].data.clone());
    }

    let n = replicates.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            if replicates[i].quality.valid && replicates[j].quality.valid {
                let d = simple_distance(&replicates[i].data, &replicates[j].data);
                matrix[i][j] = d;
                matrix[j][i] = d;
            }
        }
    }

    let confidence = if valid.is_empty() {
        0.0
    } else if valid.len() == 1 {
        0.5
    } else if valid.windows(2).all(|w| w[0].data == w[1].data) {
        0.95
    } else {
        0.7
    };

    BundleSummary {
        consensus,
        disagreements,
        pairwise_distance: Some(matrix),
        distributions: None,
        confidence: Some(confidence),
        truncated: false,
        truncation_info: None,
    }
}

/// Max pairwise distance across completed valid replicates; `None` until two
/// have completed.
fn max_pairwise_distance(replicates: &[Replicate]) -> Option<f64> {
    let valid: Vec<&Replicate> = replicates.iter().filter(|r| r.quality.valid).collect();
    if valid.len() < 2 {
        return None;
    }
    let mut max = 0.0f64;
    for i in 0..valid.len() {
        for j in (i + 1)..valid.len() {
            max = max.max(simple_distance(&valid[i].data, &valid[j].data));
        }
    }
    Some(max)
}

/// Run K replicates concurrently (bounded by `max_parallel`), validate,
/// summarize, and emit streaming events along the way.
pub async fn run_bundle(
    request: &Value,
    options: &BundleOptions,
    events: Option<&OrchestratorEvents>,
    runner: Arc<dyn ReplicateRunner>,
) -> Result<EvidenceBundle, OrchestrationError> {
    let started = Instant::now();
    let seeds = options.effective_seeds();
    let task = request
        .get("task")
        .and_then(Value::as_str)
        .unwrap_or("bundle")
        .to_string();

    if let Some(events) = events {
        events
            .emit_tool_event("bundle_started", json!({"k": options.k}))
            .await;
    }

    let semaphore = Arc::new(Semaphore::new(options.max_parallel as usize));
    let mut join_set: JoinSet<(usize, i64, u64, Result<ReplicateOutput, OrchestrationError>)> =
        JoinSet::new();
    for (index, seed) in seeds.iter().copied().enumerate() {
        let runner = runner.clone();
        let request = request.clone();
        let options = options.clone();
        let semaphore = semaphore.clone();
        join_set.spawn(async move {
            let _permit = semaphore.acquire().await;
            let replicate_started = Instant::now();
            let result = runner.run_replicate(&request, seed, &options).await;
            (
                index,
                seed,
                replicate_started.elapsed().as_millis() as u64,
                result,
            )
        });
    }

    let mut replicates: Vec<(usize, Replicate)> = Vec::new();
    let mut early_stopped = false;
    let mut partial_summary_sent = false;
    let mut cost_total = 0.0;
    let mut saw_cost = false;

    while let Some(joined) = join_set.join_next().await {
        let Ok((index, seed, elapsed_ms, result)) = joined else {
            warn!("replicate task aborted or panicked before completion");
            continue;
        };
        let replicate = match result {
            Ok(output) => {
                if let Some(cost) = output.cost_usd {
                    cost_total += cost;
                    saw_cost = true;
                }
                let errors = match &options.schema {
                    Some(schema) => validate_against_schema(&output.data, schema),
                    None => Vec::new(),
                };
                let valid = errors.is_empty();
                Replicate {
                    id: format!("r{}", index + 1),
                    data: output.data,
                    quality: ReplicateQuality {
                        valid,
                        errors: if valid { None } else { Some(errors) },
                        ..ReplicateQuality::default()
                    },
                    usage: output.usage,
                    elapsed_ms: Some(elapsed_ms),
                    seed: Some(seed),
                    model: output.model.or_else(|| {
                        request.get("model").and_then(Value::as_str).map(str::to_string)
                    }),
                }
            }
            Err(error) => Replicate {
                id: format!("r{}", index + 1),
                data: json!({"error": error.to_string()}),
                quality: ReplicateQuality {
                    valid: false,
                    errors: Some(vec![error.to_string()]),
                    ..ReplicateQuality::default()
                },
                usage: None,
                elapsed_ms: Some(elapsed_ms),
                seed: Some(seed),
                model: None,
            },
        };

        if let Some(events) = events {
            events
                .emit_tool_event(
                    "replicate_done",
                    json!({
                        "replicate_id": replicate.id,
                        "valid": replicate.quality.valid,
                        "elapsed_ms": replicate.elapsed_ms,
                    }),
                )
                .await;
        }
        replicates.push((index, replicate));

        let done: Vec<Replicate> = replicates.iter().map(|(_, r)| r.clone()).collect();
        let valid_count = done.iter().filter(|r| r.quality.valid).count();
        if valid_count >= 2 {
            if let (Some(events), false) = (events, partial_summary_sent) {
                let interim = compute_summary(&done);
                events
                    .emit_tool_event(
                        "partial_summary",
                        json!({"confidence": interim.confidence}),
                    )
                    .await;
                partial_summary_sent = true;
            }
            if runner.supports_early_stop() {
                if let Some(max_distance) = max_pairwise_distance(&done) {
                    if max_distance <= options.epsilon && !join_set.is_empty() {
                        join_set.abort_all();
                        early_stopped = true;
                        break;
                    }
                }
            }
        }
    }
    drop(join_set);

    replicates.sort_by_key(|(index, _)| *index);
    let replicates: Vec<Replicate> = replicates.into_iter().map(|(_, r)| r).collect();
    let summary = compute_summary(&replicates);

    let mut usage_total = Usage::default();
    let mut saw_usage = false;
    for replicate in &replicates {
        if let Some(usage) = &replicate.usage {
            usage_total.add(usage);
            saw_usage = true;
        }
    }

    let valid_count = replicates.iter().filter(|r| r.quality.valid).count();
    if let Some(events) = events {
        events
            .emit_tool_event(
                "bundle_ready",
                json!({
                    "replicate_count": replicates.len(),
                    "valid_count": valid_count,
                    "confidence": summary.confidence,
                }),
            )
            .await;
    }

    Ok(EvidenceBundle {
        meta: BundleMeta {
            task,
            k: options.k,
            k_completed: replicates.len() as u32,
            model: request
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            seeds,
            early_stopped,
            early_stop_reason: early_stopped
                .then(|| format!("pairwise distance within epsilon {}", options.epsilon)),
            total_elapsed_ms: started.elapsed().as_millis() as u64,
            schema_uri: options.schema_uri.clone(),
        },
        replicates,
        summary,
        usage_total: saw_usage.then_some(usage_total),
        cost_total_usd: saw_cost.then_some(cost_total),
        cost_breakdown: None,
        metadata: None,
    })
}

/// A registrable tool that fans a request out over K replicates and returns
/// the evidence bundle.
pub struct BundleTool {
    name: String,
    description: String,
    provider_hint: Option<String>,
    runner: Arc<dyn ReplicateRunner>,
}

impl BundleTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        runner: Arc<dyn ReplicateRunner>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            provider_hint: None,
            runner,
        }
    }

    pub fn with_provider_hint(mut self, provider: impl Into<String>) -> Self {
        self.provider_hint = Some(provider.into());
        self
    }
}

#[async_trait]
impl super::tool::Tool for BundleTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn provider_hint(&self) -> Option<&str> {
        self.provider_hint.as_deref()
    }

    async fn execute(
        &self,
        request: &Value,
        options: &Map<String, Value>,
        events: Option<&OrchestratorEvents>,
    ) -> Result<super::tool::ToolResult, OrchestrationError> {
        let bundle_options = BundleOptions::from_map(options);
        let bundle = run_bundle(request, &bundle_options, events, self.runner.clone()).await?;
        Ok(super::tool::ToolResult::Bundle(Box::new(bundle)))
    }
}

/// Replicate runner backed by the router: each replicate is one deterministic
/// LLM generation with the replicate's seed.
pub struct LlmReplicateRunner {
    client: Arc<crate::router::Client>,
}

impl LlmReplicateRunner {
    pub fn new(client: Arc<crate::router::Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReplicateRunner for LlmReplicateRunner {
    async fn run_replicate(
        &self,
        request: &Value,
        seed: i64,
        options: &BundleOptions,
    ) -> Result<ReplicateOutput, OrchestrationError> {
        let model = request
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(crate::registry::models::DEFAULT_MODEL);
        let query = request
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut raw = request
            .get("parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        raw.insert("seed".into(), json!(seed));
        let caps = crate::registry::capabilities::capabilities_for(model);
        let settings = crate::registry::policy::deterministic_settings(caps);
        if let Some(temperature) = settings.temperature {
            raw.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = settings.top_p {
            raw.insert("top_p".into(), json!(top_p));
        }
        if let Some(budget) = &options.per_replicate_budget {
            if let Some(tokens) = budget.get("tokens").and_then(Value::as_u64) {
                let existing = raw
                    .get("max_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(tokens);
                raw.insert("max_tokens".into(), json!(existing.min(tokens)));
            }
        }

        let response = self
            .client
            .generate(query, model, &raw)
            .await
            .map_err(|e| match e {
                crate::errors::SteerError::Provider(p) => OrchestrationError::Provider(p),
                other => OrchestrationError::orchestrator(other.to_string(), "GENERATION_FAILED"),
            })?;

        let data = serde_json::from_str::<Value>(&response.text)
            .unwrap_or(Value::String(response.text));
        Ok(ReplicateOutput {
            data,
            usage: Some(response.usage),
            cost_usd: response.cost_usd,
            model: Some(response.model),
        })
    }
}
