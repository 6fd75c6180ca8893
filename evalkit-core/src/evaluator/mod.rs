//! Pluggable scoring
//!
//! An [`Evaluator`] scores actual invocations against expected ones for one
//! metric. The [`Registry`] maps metric names to evaluators; the scoring stage
//! looks every configured metric up there.

mod builtin;

pub use builtin::{FinalResponseMatch, ToolTrajectoryMatch};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::context::EvalContext;
use crate::error::{EvalError, Result};
use crate::evalset::Invocation;
use crate::status::EvalStatus;

/// A metric to compute, with its pass threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalMetric {
    pub metric_name: String,
    pub threshold: f64,
    /// Evaluator-specific settings
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub criterion: Value,
}

impl EvalMetric {
    pub fn new(metric_name: impl Into<String>, threshold: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            threshold,
            criterion: Value::Null,
        }
    }
}

/// Score of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerInvocationResult {
    pub actual_invocation: Invocation,
    pub expected_invocation: Option<Invocation>,
    pub score: Option<f64>,
    pub status: EvalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of one evaluator over a whole case
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub overall_score: Option<f64>,
    pub overall_status: EvalStatus,
    pub per_invocation_results: Vec<PerInvocationResult>,
}

impl EvaluateResult {
    /// Average per-invocation scores into an overall result
    pub fn from_per_invocation(results: Vec<PerInvocationResult>, threshold: f64) -> Self {
        let scores: Vec<f64> = results.iter().filter_map(|r| r.score).collect();
        if scores.is_empty() {
            return Self {
                overall_score: None,
                overall_status: EvalStatus::NotEvaluated,
                per_invocation_results: results,
            };
        }
        let overall = scores.iter().sum::<f64>() / scores.len() as f64;
        Self {
            overall_score: Some(overall),
            overall_status: EvalStatus::for_score(overall, threshold),
            per_invocation_results: results,
        }
    }
}

/// Scoring algorithm for one metric
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Metric name this evaluator computes
    fn name(&self) -> &str;

    /// What the evaluator checks
    fn description(&self) -> &str {
        ""
    }

    /// Score actual invocations against expected ones
    async fn evaluate(
        &self,
        ctx: &EvalContext,
        actuals: &[Invocation],
        expecteds: &[Invocation],
        metric: &EvalMetric,
    ) -> Result<EvaluateResult>;
}

/// Metric name to evaluator lookup
pub struct Registry {
    evaluators: RwLock<HashMap<String, Arc<dyn Evaluator>>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            evaluators: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry holding the built-in evaluators
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(FinalResponseMatch));
        registry.register(Arc::new(ToolTrajectoryMatch));
        registry
    }

    /// Register an evaluator under its own name, replacing any previous one
    pub fn register(&self, evaluator: Arc<dyn Evaluator>) {
        let name = evaluator.name().to_string();
        self.register_as(name, evaluator);
    }

    /// Register an evaluator under an explicit metric name
    pub fn register_as(&self, metric_name: impl Into<String>, evaluator: Arc<dyn Evaluator>) {
        if let Ok(mut evaluators) = self.evaluators.write() {
            evaluators.insert(metric_name.into(), evaluator);
        }
    }

    /// Look up the evaluator for a metric
    pub fn get(&self, metric_name: &str) -> Result<Arc<dyn Evaluator>> {
        self.evaluators
            .read()
            .map_err(|_| EvalError::Other("evaluator registry lock poisoned".to_string()))?
            .get(metric_name)
            .cloned()
            .ok_or_else(|| EvalError::NotFound(format!("evaluator for metric {}", metric_name)))
    }

    /// Registered metric names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .evaluators
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
