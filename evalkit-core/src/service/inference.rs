//! Inference stage

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::callbacks::{AfterInferenceCaseArgs, AfterInferenceSetArgs, BeforeInferenceCaseArgs};
use super::executor::{run_parallel, run_serial, CaseStage, TaskParam};
use super::options::{EvalOption, Options};
use super::pool::MemoizedPool;
use super::recycler::ParamRecycler;
use super::runner::{case_run_options, run_conversation};
use super::{InferenceRequest, InferenceResult, ServiceInner};
use crate::context::EvalContext;
use crate::error::{EvalError, Result};
use crate::evalset::{CaseSource, EvalCase, EvalMode, Invocation};
use crate::status::EvalStatus;

pub(crate) struct InferenceStage;

#[async_trait]
impl CaseStage for InferenceStage {
    type Request = InferenceRequest;
    type Item = EvalCase;
    type Output = InferenceResult;

    const NAME: &'static str = "inference";

    fn session_id(_eval_case: &EvalCase, opts: &Options, ctx: &EvalContext) -> String {
        opts.session_id(ctx)
    }

    async fn process(
        svc: &ServiceInner,
        ctx: &EvalContext,
        request: &InferenceRequest,
        eval_case: &EvalCase,
        opts: &Options,
        session_id: &str,
    ) -> InferenceResult {
        let callbacks = opts.callbacks();
        debug!(eval_case_id = %eval_case.eval_id, %session_id, "inference case started");

        let before = BeforeInferenceCaseArgs {
            request,
            eval_case_id: &eval_case.eval_id,
            session_id,
        };
        let (ctx, before_error) = match callbacks.run_before_inference_case(ctx, &before).await {
            Ok(ctx) => (ctx, None),
            Err(err) => (
                ctx.clone(),
                Some(err.context(format!(
                    "run before inference case callbacks (app={}, eval_set_id={}, eval_case_id={}, session_id={})",
                    request.app_name, request.eval_set_id, eval_case.eval_id, session_id
                ))),
            ),
        };

        let start_time = Utc::now();
        let mut result = InferenceResult::for_case(request, eval_case, session_id);
        let error = match before_error {
            Some(err) => Some(err),
            None => {
                let case_ctx = opts.case_context(&ctx);
                match infer_case(svc, &case_ctx, eval_case, session_id, opts).await {
                    Ok(inferences) => {
                        result.status = EvalStatus::Passed;
                        result.inferences = Some(inferences);
                        None
                    }
                    Err(err) => Some(err.context(format!(
                        "inference eval case (eval_case_id={}, session_id={})",
                        eval_case.eval_id, session_id
                    ))),
                }
            }
        };
        if let Some(err) = error.as_ref() {
            result.fail(err);
        }

        let after = AfterInferenceCaseArgs {
            request,
            eval_case_id: &eval_case.eval_id,
            result: &result,
            error: error.as_ref(),
            start_time,
        };
        if let Err(after_err) = callbacks.run_after_inference_case(&ctx, &after).await {
            let after_err = after_err.context(format!(
                "run after inference case callbacks (app={}, eval_set_id={}, eval_case_id={})",
                request.app_name, request.eval_set_id, eval_case.eval_id
            ));
            result.fail(&EvalError::join(error, after_err));
        }

        debug!(eval_case_id = %eval_case.eval_id, status = %result.status, "inference case finished");
        result
    }

    fn failed(
        request: &InferenceRequest,
        eval_case: &EvalCase,
        session_id: Option<&str>,
        err: EvalError,
    ) -> InferenceResult {
        let mut result = InferenceResult::for_case(request, eval_case, session_id.unwrap_or_default());
        result.fail(&err);
        result
    }

    fn case_id(eval_case: &EvalCase) -> &str {
        &eval_case.eval_id
    }

    fn pool(svc: &ServiceInner) -> &MemoizedPool<TaskParam<Self>> {
        &svc.inference_pool
    }

    fn recycler(svc: &ServiceInner) -> &ParamRecycler<TaskParam<Self>> {
        &svc.inference_params
    }
}

/// Validate a case and produce its invocations
async fn infer_case(
    svc: &ServiceInner,
    ctx: &EvalContext,
    eval_case: &EvalCase,
    session_id: &str,
    opts: &Options,
) -> Result<Vec<Invocation>> {
    let session_input = eval_case
        .session_input
        .as_ref()
        .ok_or_else(|| EvalError::CaseValidation("session input is nil".to_string()))?;
    if !eval_case.actual_conversation.is_empty() && eval_case.eval_mode != EvalMode::Trace {
        return Err(EvalError::CaseValidation(
            "actual conversation is only supported in trace mode".to_string(),
        ));
    }

    if eval_case.eval_mode == EvalMode::Trace {
        return trace_invocations(eval_case);
    }

    if eval_case.conversation.is_empty() {
        return Err(EvalError::CaseValidation("invocations are empty".to_string()));
    }
    let run_options = case_run_options(&opts.run_options, &eval_case.context_messages, session_input);
    run_conversation(
        ctx,
        svc.runtime.as_ref(),
        &eval_case.conversation,
        session_input,
        session_id,
        &run_options,
        &eval_case.context_messages,
    )
    .await
}

/// Recorded invocations of a trace-mode case, passed through unchanged
fn trace_invocations(eval_case: &EvalCase) -> Result<Vec<Invocation>> {
    let actual = &eval_case.actual_conversation;
    let expected = &eval_case.conversation;
    if actual.is_empty() {
        if expected.is_empty() {
            return Err(EvalError::CaseValidation("invocations are empty".to_string()));
        }
        return Ok(expected.clone());
    }

    if !expected.is_empty() && actual.len() != expected.len() {
        return Err(EvalError::CaseValidation(format!(
            "actual conversation length {} does not match conversation length {}",
            actual.len(),
            expected.len()
        )));
    }
    if let Some(idx) = actual.iter().position(|i| i.user_content.is_none()) {
        return Err(EvalError::CaseValidation(format!(
            "actual invocation user content is nil at index {}",
            idx
        )));
    }
    Ok(actual.clone())
}

/// Cases of the set, narrowed to the requested ids, in set order
async fn load_cases(
    ctx: &EvalContext,
    source: &dyn CaseSource,
    request: &InferenceRequest,
) -> Result<Vec<EvalCase>> {
    let set = source
        .get(ctx, &request.app_name, &request.eval_set_id)
        .await
        .map_err(|e| e.context("get eval set"))?;
    if request.eval_case_ids.is_empty() {
        return Ok(set.eval_cases);
    }
    Ok(set
        .eval_cases
        .into_iter()
        .filter(|c| request.eval_case_ids.contains(&c.eval_id))
        .collect())
}

impl ServiceInner {
    fn resolve_inference_options(&self, overrides: Vec<EvalOption>) -> Result<Options> {
        let opts = self.defaults.apply(overrides);
        opts.validate_inference()?;
        if opts.parallel_inference {
            InferenceStage::ensure_pool(self, &opts)?;
        }
        Ok(opts)
    }
}

pub(crate) async fn infer(
    svc: &Arc<ServiceInner>,
    ctx: &EvalContext,
    mut request: InferenceRequest,
    overrides: Vec<EvalOption>,
) -> Result<Vec<InferenceResult>> {
    request
        .validate()
        .map_err(|e| e.context("validate inference request"))?;
    let opts = svc.resolve_inference_options(overrides)?;
    let callbacks = opts.callbacks();

    let before = callbacks.run_before_inference_set(ctx, &mut request).await;
    let ctx = before.map_err(|e| {
        e.context(format!(
            "run before inference set callbacks (app={}, eval_set_id={})",
            request.app_name, request.eval_set_id
        ))
    })?;

    let start_time = Utc::now();
    let started = Instant::now();
    info!(
        app = %request.app_name,
        eval_set_id = %request.eval_set_id,
        parallel = opts.parallel_inference,
        "inference started"
    );

    let (results, error) = match infer_cases(svc, &ctx, &request, opts).await {
        Ok(results) => (results, None),
        Err(err) => (Vec::new(), Some(err)),
    };

    let after = AfterInferenceSetArgs {
        request: &request,
        results: &results,
        error: error.as_ref(),
        start_time,
    };
    if let Err(after_err) = callbacks.run_after_inference_set(&ctx, &after).await {
        return Err(after_err.context(format!(
            "run after inference set callbacks (app={}, eval_set_id={})",
            request.app_name, request.eval_set_id
        )));
    }
    if let Some(err) = error {
        return Err(err);
    }

    info!(
        app = %request.app_name,
        eval_set_id = %request.eval_set_id,
        cases = results.len(),
        failed = results.iter().filter(|r| r.status == EvalStatus::Failed).count(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "inference finished"
    );
    Ok(results)
}

async fn infer_cases(
    svc: &Arc<ServiceInner>,
    ctx: &EvalContext,
    request: &InferenceRequest,
    opts: Options,
) -> Result<Vec<InferenceResult>> {
    let source = opts
        .case_source
        .clone()
        .ok_or_else(|| EvalError::Configuration("case source is nil".to_string()))?;
    let cases = load_cases(ctx, source.as_ref(), request)
        .await
        .map_err(|e| e.context("load inference eval cases"))?;
    if cases.is_empty() {
        return Ok(Vec::new());
    }

    if opts.parallel_inference {
        Ok(run_parallel::<InferenceStage>(svc, ctx, Arc::new(request.clone()), cases, Arc::new(opts)).await)
    } else {
        Ok(run_serial::<InferenceStage>(svc, ctx, request, &cases, &opts).await)
    }
}
