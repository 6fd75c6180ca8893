//! Local evaluation service
//!
//! [`LocalEvalService`] runs the two stages of an evaluation:
//!
//! - **inference**: replay each eval case against the agent runtime and
//!   capture what it produced ([`LocalEvalService::infer`])
//! - **scoring**: score the captured invocations with the configured metrics
//!   ([`LocalEvalService::evaluate`])
//!
//! Both stages share one executor. Cases run inline in order, or on a fixed-size
//! worker pool that is created on first use and kept for the life of the
//! service. Results always come back in case order, and a failing case never
//! affects another case.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use evalkit_core::prelude::*;
//!
//! # async fn example() -> evalkit_core::error::Result<()> {
//! let source = Arc::new(InMemoryCaseSource::new());
//! let set = EvalSet::load("evalsets/math.json")?;
//! let runtime = Arc::new(ReplayRuntime::from_set(&set));
//! source.put("math-agent", set)?;
//!
//! let service = LocalEvalService::new(
//!     runtime,
//!     [with_case_source(source), with_parallel_inference(true)],
//! )?;
//! let results = service
//!     .infer(&EvalContext::new(), InferenceRequest::new("math-agent", "math"), [])
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod callbacks;
mod evaluate;
mod executor;
mod inference;
mod options;
mod pool;
mod recycler;
mod runner;

#[cfg(test)]
mod tests;

pub use callbacks::{
    AfterEvaluateCaseArgs, AfterEvaluateSetArgs, AfterInferenceCaseArgs, AfterInferenceSetArgs,
    BeforeEvaluateCaseArgs, BeforeInferenceCaseArgs, Callbacks, EvalCallback,
};
pub use options::{
    EvalOption, Options, SessionIdSupplier, with_callbacks, with_case_parallelism,
    with_case_source, with_case_timeout, with_nonblocking_submit, with_parallel_evaluation,
    with_parallel_inference, with_registry, with_run_options, with_session_id_supplier,
};
pub use recycler::RecyclerStats;

pub(crate) use options::default_parallelism;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::EvalServiceConfig;
use crate::context::EvalContext;
use crate::error::{EvalError, Result};
use crate::evalset::{EvalCase, EvalMode, Invocation};
use crate::evaluator::EvalMetric;
use crate::runtime::AgentRuntime;
use crate::status::EvalStatus;

use evaluate::EvaluationStage;
use executor::TaskParam;
use inference::InferenceStage;
use pool::MemoizedPool;
use recycler::ParamRecycler;

/// Request to run inference over an eval set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub app_name: String,
    pub eval_set_id: String,
    /// Cases to run; empty means every case of the set
    #[serde(default)]
    pub eval_case_ids: Vec<String>,
}

impl InferenceRequest {
    pub fn new(app_name: impl Into<String>, eval_set_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            eval_set_id: eval_set_id.into(),
            eval_case_ids: Vec::new(),
        }
    }

    /// Restrict the batch to the given case ids
    pub fn with_case_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.eval_case_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            return Err(EvalError::InvalidRequest("app name is empty".to_string()));
        }
        if self.eval_set_id.is_empty() {
            return Err(EvalError::InvalidRequest("eval set id is empty".to_string()));
        }
        Ok(())
    }
}

/// Inference outcome of one eval case
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    pub app_name: String,
    pub eval_set_id: String,
    pub eval_case_id: String,
    pub eval_mode: EvalMode,
    pub session_id: String,
    pub user_id: String,
    pub status: EvalStatus,
    /// Set iff the case failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Produced invocations; `None` iff the case failed
    #[serde(default)]
    pub inferences: Option<Vec<Invocation>>,
}

impl InferenceResult {
    pub(crate) fn for_case(request: &InferenceRequest, eval_case: &EvalCase, session_id: &str) -> Self {
        Self {
            app_name: request.app_name.clone(),
            eval_set_id: request.eval_set_id.clone(),
            eval_case_id: eval_case.eval_id.clone(),
            eval_mode: eval_case.eval_mode,
            session_id: session_id.to_string(),
            user_id: eval_case.user_id().to_string(),
            status: EvalStatus::NotEvaluated,
            error_message: None,
            inferences: None,
        }
    }

    /// Mark failed: record the message and drop any produced invocations
    pub(crate) fn fail(&mut self, err: &EvalError) {
        self.status = EvalStatus::Failed;
        self.error_message = Some(err.to_string());
        self.inferences = None;
    }
}

/// Metrics to compute in the scoring stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateConfig {
    pub eval_metrics: Vec<EvalMetric>,
}

/// Request to score inference results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    pub app_name: String,
    pub eval_set_id: String,
    pub inference_results: Vec<InferenceResult>,
    pub evaluate_config: Option<EvaluateConfig>,
}

impl EvaluateRequest {
    pub fn new(
        app_name: impl Into<String>,
        eval_set_id: impl Into<String>,
        inference_results: Vec<InferenceResult>,
        eval_metrics: Vec<EvalMetric>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            eval_set_id: eval_set_id.into(),
            inference_results,
            evaluate_config: Some(EvaluateConfig { eval_metrics }),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            return Err(EvalError::InvalidRequest("app name is empty".to_string()));
        }
        if self.eval_set_id.is_empty() {
            return Err(EvalError::InvalidRequest("eval set id is empty".to_string()));
        }
        if self.evaluate_config.is_none() {
            return Err(EvalError::InvalidRequest("evaluate config is nil".to_string()));
        }
        Ok(())
    }
}

/// Score of one metric, over a case or over one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalMetricResult {
    pub metric_name: String,
    pub threshold: f64,
    pub score: Option<f64>,
    pub eval_status: EvalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// All metric scores of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalMetricResultPerInvocation {
    pub actual_invocation: Invocation,
    pub expected_invocation: Option<Invocation>,
    pub eval_metric_results: Vec<EvalMetricResult>,
}

/// Scoring outcome of one eval case
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalCaseResult {
    pub eval_set_id: String,
    pub eval_id: String,
    pub session_id: String,
    pub user_id: String,
    pub final_eval_status: EvalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub overall_eval_metric_results: Vec<EvalMetricResult>,
    #[serde(default)]
    pub eval_metric_result_per_invocation: Vec<EvalMetricResultPerInvocation>,
}

impl EvalCaseResult {
    pub(crate) fn for_inference(inference: &InferenceResult) -> Self {
        Self {
            eval_set_id: inference.eval_set_id.clone(),
            eval_id: inference.eval_case_id.clone(),
            session_id: inference.session_id.clone(),
            user_id: inference.user_id.clone(),
            ..Default::default()
        }
    }

    /// Mark failed: record the message and drop any metric results
    pub(crate) fn fail(&mut self, err: &EvalError) {
        self.final_eval_status = EvalStatus::Failed;
        self.error_message = Some(err.to_string());
        self.overall_eval_metric_results.clear();
        self.eval_metric_result_per_invocation.clear();
    }
}

/// Param recycler counters of both stages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub inference: RecyclerStats,
    pub evaluation: RecyclerStats,
}

/// State shared between the service handle and its workers
pub(crate) struct ServiceInner {
    pub(crate) runtime: Arc<dyn AgentRuntime>,
    pub(crate) defaults: Options,
    pub(crate) inference_pool: MemoizedPool<TaskParam<InferenceStage>>,
    pub(crate) evaluation_pool: MemoizedPool<TaskParam<EvaluationStage>>,
    pub(crate) inference_params: ParamRecycler<TaskParam<InferenceStage>>,
    pub(crate) evaluation_params: ParamRecycler<TaskParam<EvaluationStage>>,
}

/// In-process evaluation service
pub struct LocalEvalService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for LocalEvalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEvalService")
            .field("defaults", &self.inner.defaults)
            .finish()
    }
}

impl LocalEvalService {
    /// Create a service; `options` become the defaults of every call
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        options: impl IntoIterator<Item = EvalOption>,
    ) -> Result<Self> {
        let defaults = Options::default().apply(options);
        Self::with_defaults(runtime, defaults)
    }

    /// Create a service from loaded configuration, then apply `options`
    pub fn from_config(
        runtime: Arc<dyn AgentRuntime>,
        config: &EvalServiceConfig,
        options: impl IntoIterator<Item = EvalOption>,
    ) -> Result<Self> {
        config.validate()?;
        let defaults = config.to_options().apply(options);
        Self::with_defaults(runtime, defaults)
    }

    fn with_defaults(runtime: Arc<dyn AgentRuntime>, defaults: Options) -> Result<Self> {
        if (defaults.parallel_inference || defaults.parallel_evaluation)
            && defaults.case_parallelism == 0
        {
            return Err(EvalError::Configuration(
                "eval case parallelism must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(ServiceInner {
                runtime,
                defaults,
                inference_pool: MemoizedPool::new(),
                evaluation_pool: MemoizedPool::new(),
                inference_params: ParamRecycler::new(),
                evaluation_params: ParamRecycler::new(),
            }),
        })
    }

    /// Run the agent for the requested cases; results follow case order
    pub async fn infer(
        &self,
        ctx: &EvalContext,
        request: InferenceRequest,
        options: impl IntoIterator<Item = EvalOption>,
    ) -> Result<Vec<InferenceResult>> {
        inference::infer(&self.inner, ctx, request, options.into_iter().collect()).await
    }

    /// Score inference results; results follow the order of the request
    pub async fn evaluate(
        &self,
        ctx: &EvalContext,
        request: EvaluateRequest,
        options: impl IntoIterator<Item = EvalOption>,
    ) -> Result<Vec<EvalCaseResult>> {
        evaluate::evaluate(&self.inner, ctx, request, options.into_iter().collect()).await
    }

    /// Shut both worker pools; later parallel batches reject every case
    pub fn close(&self) {
        self.inner.inference_pool.close();
        self.inner.evaluation_pool.close();
    }

    /// Recycler counters of both stages
    pub fn recycler_stats(&self) -> ServiceStats {
        ServiceStats {
            inference: self.inner.inference_params.stats(),
            evaluation: self.inner.evaluation_params.stats(),
        }
    }
}
