//! Callback chain around batches and cases
//!
//! Hooks implement [`EvalCallback`] and override only the phases they care
//! about. [`Callbacks`] keeps them in registration order under a name;
//! registering a name twice replaces the earlier hook in place.
//!
//! Every phase stops at the first failing hook. Before-phases may return a
//! derived [`EvalContext`], which the next hook and all later work receive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use super::{EvalCaseResult, EvaluateRequest, InferenceRequest, InferenceResult};
use crate::context::EvalContext;
use crate::error::{EvalError, Result};

/// Arguments of the after-inference-set phase
pub struct AfterInferenceSetArgs<'a> {
    pub request: &'a InferenceRequest,
    pub results: &'a [InferenceResult],
    pub error: Option<&'a EvalError>,
    pub start_time: DateTime<Utc>,
}

/// Arguments of the before-inference-case phase
pub struct BeforeInferenceCaseArgs<'a> {
    pub request: &'a InferenceRequest,
    pub eval_case_id: &'a str,
    pub session_id: &'a str,
}

/// Arguments of the after-inference-case phase
pub struct AfterInferenceCaseArgs<'a> {
    pub request: &'a InferenceRequest,
    pub eval_case_id: &'a str,
    pub result: &'a InferenceResult,
    pub error: Option<&'a EvalError>,
    pub start_time: DateTime<Utc>,
}

/// Arguments of the after-evaluate-set phase
pub struct AfterEvaluateSetArgs<'a> {
    pub request: &'a EvaluateRequest,
    pub results: &'a [EvalCaseResult],
    pub error: Option<&'a EvalError>,
    pub start_time: DateTime<Utc>,
}

/// Arguments of the before-evaluate-case phase
pub struct BeforeEvaluateCaseArgs<'a> {
    pub request: &'a EvaluateRequest,
    pub eval_case_id: &'a str,
}

/// Arguments of the after-evaluate-case phase
pub struct AfterEvaluateCaseArgs<'a> {
    pub request: &'a EvaluateRequest,
    pub eval_case_id: &'a str,
    pub inference_result: &'a InferenceResult,
    pub result: &'a EvalCaseResult,
    pub error: Option<&'a EvalError>,
    pub start_time: DateTime<Utc>,
}

/// Hook into the inference and scoring stages
///
/// All methods default to no-ops.
#[async_trait]
pub trait EvalCallback: Send + Sync {
    /// Before an inference batch; may rewrite the request
    async fn before_inference_set(
        &self,
        _ctx: &EvalContext,
        _request: &mut InferenceRequest,
    ) -> Result<Option<EvalContext>> {
        Ok(None)
    }

    /// After an inference batch, whatever its outcome
    async fn after_inference_set(
        &self,
        _ctx: &EvalContext,
        _args: &AfterInferenceSetArgs<'_>,
    ) -> Result<()> {
        Ok(())
    }

    /// Before one case is inferred
    async fn before_inference_case(
        &self,
        _ctx: &EvalContext,
        _args: &BeforeInferenceCaseArgs<'_>,
    ) -> Result<Option<EvalContext>> {
        Ok(None)
    }

    /// After one case is inferred, whatever its outcome
    async fn after_inference_case(
        &self,
        _ctx: &EvalContext,
        _args: &AfterInferenceCaseArgs<'_>,
    ) -> Result<()> {
        Ok(())
    }

    /// Before a scoring batch; may rewrite the request
    async fn before_evaluate_set(
        &self,
        _ctx: &EvalContext,
        _request: &mut EvaluateRequest,
    ) -> Result<Option<EvalContext>> {
        Ok(None)
    }

    /// After a scoring batch, whatever its outcome
    async fn after_evaluate_set(
        &self,
        _ctx: &EvalContext,
        _args: &AfterEvaluateSetArgs<'_>,
    ) -> Result<()> {
        Ok(())
    }

    /// Before one case is scored
    async fn before_evaluate_case(
        &self,
        _ctx: &EvalContext,
        _args: &BeforeEvaluateCaseArgs<'_>,
    ) -> Result<Option<EvalContext>> {
        Ok(None)
    }

    /// After one case is scored, whatever its outcome
    async fn after_evaluate_case(
        &self,
        _ctx: &EvalContext,
        _args: &AfterEvaluateCaseArgs<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Ordered, named set of hooks
#[derive(Clone, Default)]
pub struct Callbacks {
    hooks: Vec<(String, Arc<dyn EvalCallback>)>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("hooks", &self.names())
            .finish()
    }
}

impl Callbacks {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook under `name`
    pub fn register(mut self, name: impl Into<String>, hook: Arc<dyn EvalCallback>) -> Self {
        let name = name.into();
        match self.hooks.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = hook,
            None => self.hooks.push((name, hook)),
        }
        self
    }

    /// Hook names in run order
    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub(crate) async fn run_before_inference_set(
        &self,
        ctx: &EvalContext,
        request: &mut InferenceRequest,
    ) -> Result<EvalContext> {
        let mut ctx = ctx.clone();
        for (name, hook) in &self.hooks {
            debug!(callback = %name, "before inference set");
            if let Some(next) = hook.before_inference_set(&ctx, request).await? {
                ctx = next;
            }
        }
        Ok(ctx)
    }

    pub(crate) async fn run_after_inference_set(
        &self,
        ctx: &EvalContext,
        args: &AfterInferenceSetArgs<'_>,
    ) -> Result<()> {
        for (_, hook) in &self.hooks {
            hook.after_inference_set(ctx, args).await?;
        }
        Ok(())
    }

    pub(crate) async fn run_before_inference_case(
        &self,
        ctx: &EvalContext,
        args: &BeforeInferenceCaseArgs<'_>,
    ) -> Result<EvalContext> {
        let mut ctx = ctx.clone();
        for (_, hook) in &self.hooks {
            if let Some(next) = hook.before_inference_case(&ctx, args).await? {
                ctx = next;
            }
        }
        Ok(ctx)
    }

    pub(crate) async fn run_after_inference_case(
        &self,
        ctx: &EvalContext,
        args: &AfterInferenceCaseArgs<'_>,
    ) -> Result<()> {
        for (_, hook) in &self.hooks {
            hook.after_inference_case(ctx, args).await?;
        }
        Ok(())
    }

    pub(crate) async fn run_before_evaluate_set(
        &self,
        ctx: &EvalContext,
        request: &mut EvaluateRequest,
    ) -> Result<EvalContext> {
        let mut ctx = ctx.clone();
        for (name, hook) in &self.hooks {
            debug!(callback = %name, "before evaluate set");
            if let Some(next) = hook.before_evaluate_set(&ctx, request).await? {
                ctx = next;
            }
        }
        Ok(ctx)
    }

    pub(crate) async fn run_after_evaluate_set(
        &self,
        ctx: &EvalContext,
        args: &AfterEvaluateSetArgs<'_>,
    ) -> Result<()> {
        for (_, hook) in &self.hooks {
            hook.after_evaluate_set(ctx, args).await?;
        }
        Ok(())
    }

    pub(crate) async fn run_before_evaluate_case(
        &self,
        ctx: &EvalContext,
        args: &BeforeEvaluateCaseArgs<'_>,
    ) -> Result<EvalContext> {
        let mut ctx = ctx.clone();
        for (_, hook) in &self.hooks {
            if let Some(next) = hook.before_evaluate_case(&ctx, args).await? {
                ctx = next;
            }
        }
        Ok(ctx)
    }

    pub(crate) async fn run_after_evaluate_case(
        &self,
        ctx: &EvalContext,
        args: &AfterEvaluateCaseArgs<'_>,
    ) -> Result<()> {
        for (_, hook) in &self.hooks {
            hook.after_evaluate_case(ctx, args).await?;
        }
        Ok(())
    }
}
