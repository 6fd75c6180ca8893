//! Scoring stage

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::callbacks::{AfterEvaluateCaseArgs, AfterEvaluateSetArgs, BeforeEvaluateCaseArgs};
use super::executor::{run_parallel, run_serial, CaseStage, TaskParam};
use super::options::{EvalOption, Options};
use super::pool::MemoizedPool;
use super::recycler::ParamRecycler;
use super::{
    EvalCaseResult, EvalMetricResult, EvalMetricResultPerInvocation, EvaluateRequest,
    InferenceResult, ServiceInner,
};
use crate::context::EvalContext;
use crate::error::{EvalError, Result};
use crate::evalset::EvalCase;
use crate::status::EvalStatus;

pub(crate) struct EvaluationStage;

/// One inference result paired with the eval case it came from
pub(crate) struct EvaluationItem {
    pub(crate) inference: InferenceResult,
    pub(crate) eval_case: Option<EvalCase>,
}

#[async_trait]
impl CaseStage for EvaluationStage {
    type Request = EvaluateRequest;
    type Item = EvaluationItem;
    type Output = EvalCaseResult;

    const NAME: &'static str = "evaluation";

    fn session_id(item: &EvaluationItem, _opts: &Options, _ctx: &EvalContext) -> String {
        item.inference.session_id.clone()
    }

    async fn process(
        _svc: &ServiceInner,
        ctx: &EvalContext,
        request: &EvaluateRequest,
        item: &EvaluationItem,
        opts: &Options,
        _session_id: &str,
    ) -> EvalCaseResult {
        let callbacks = opts.callbacks();
        let eval_case_id = item.inference.eval_case_id.as_str();
        debug!(%eval_case_id, "evaluation case started");

        let before = BeforeEvaluateCaseArgs {
            request,
            eval_case_id,
        };
        let (ctx, before_error) = match callbacks.run_before_evaluate_case(ctx, &before).await {
            Ok(ctx) => (ctx, None),
            Err(err) => (
                ctx.clone(),
                Some(err.context(format!(
                    "run before evaluate case callbacks (app={}, eval_set_id={}, eval_case_id={})",
                    request.app_name, request.eval_set_id, eval_case_id
                ))),
            ),
        };

        let start_time = Utc::now();
        let mut result = EvalCaseResult::for_inference(&item.inference);
        let error = match before_error {
            Some(err) => Some(err),
            None => {
                let case_ctx = opts.case_context(&ctx);
                match score_case(&case_ctx, request, item, opts).await {
                    Ok(scored) => {
                        result = scored;
                        None
                    }
                    Err(err) => Some(err.context(format!(
                        "evaluate eval case (eval_case_id={}, session_id={})",
                        eval_case_id, item.inference.session_id
                    ))),
                }
            }
        };
        if let Some(err) = error.as_ref() {
            result.fail(err);
        }

        let after = AfterEvaluateCaseArgs {
            request,
            eval_case_id,
            inference_result: &item.inference,
            result: &result,
            error: error.as_ref(),
            start_time,
        };
        if let Err(after_err) = callbacks.run_after_evaluate_case(&ctx, &after).await {
            let after_err = after_err.context(format!(
                "run after evaluate case callbacks (app={}, eval_set_id={}, eval_case_id={})",
                request.app_name, request.eval_set_id, eval_case_id
            ));
            result.fail(&EvalError::join(error, after_err));
        }

        debug!(%eval_case_id, status = %result.final_eval_status, "evaluation case finished");
        result
    }

    fn failed(
        _request: &EvaluateRequest,
        item: &EvaluationItem,
        _session_id: Option<&str>,
        err: EvalError,
    ) -> EvalCaseResult {
        let mut result = EvalCaseResult::for_inference(&item.inference);
        result.fail(&err);
        result
    }

    fn case_id(item: &EvaluationItem) -> &str {
        &item.inference.eval_case_id
    }

    fn pool(svc: &ServiceInner) -> &MemoizedPool<TaskParam<Self>> {
        &svc.evaluation_pool
    }

    fn recycler(svc: &ServiceInner) -> &ParamRecycler<TaskParam<Self>> {
        &svc.evaluation_params
    }
}

/// Run every configured metric over one case
async fn score_case(
    ctx: &EvalContext,
    request: &EvaluateRequest,
    item: &EvaluationItem,
    opts: &Options,
) -> Result<EvalCaseResult> {
    let inference = &item.inference;
    if inference.status == EvalStatus::Failed {
        return Err(EvalError::CaseValidation(format!(
            "inference failed: {}",
            inference.error_message.as_deref().unwrap_or("unknown error")
        )));
    }
    let eval_case = item.eval_case.as_ref().ok_or_else(|| {
        EvalError::NotFound(format!(
            "eval case {} in eval set {}",
            inference.eval_case_id, request.eval_set_id
        ))
    })?;
    let registry = opts
        .registry
        .as_ref()
        .ok_or_else(|| EvalError::Configuration("registry is nil".to_string()))?;

    let actuals = inference.inferences.as_deref().unwrap_or_default();
    let expecteds = eval_case.conversation.as_slice();
    let metrics = request
        .evaluate_config
        .as_ref()
        .map(|config| config.eval_metrics.as_slice())
        .unwrap_or_default();

    let mut result = EvalCaseResult::for_inference(inference);
    let mut per_invocation: Vec<EvalMetricResultPerInvocation> = actuals
        .iter()
        .enumerate()
        .map(|(idx, actual)| EvalMetricResultPerInvocation {
            actual_invocation: actual.clone(),
            expected_invocation: expecteds.get(idx).cloned(),
            eval_metric_results: Vec::new(),
        })
        .collect();

    for metric in metrics {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let evaluator = registry.get(&metric.metric_name)?;
        let scored = evaluator
            .evaluate(ctx, actuals, expecteds, metric)
            .await
            .map_err(|e| e.context(format!("run evaluator {}", metric.metric_name)))?;

        for (idx, per) in scored.per_invocation_results.into_iter().enumerate() {
            if let Some(entry) = per_invocation.get_mut(idx) {
                entry.eval_metric_results.push(EvalMetricResult {
                    metric_name: metric.metric_name.clone(),
                    threshold: metric.threshold,
                    score: per.score,
                    eval_status: per.status,
                    reason: per.reason,
                });
            }
        }
        result.overall_eval_metric_results.push(EvalMetricResult {
            metric_name: metric.metric_name.clone(),
            threshold: metric.threshold,
            score: scored.overall_score,
            eval_status: scored.overall_status,
            reason: None,
        });
    }

    result.final_eval_status = EvalStatus::aggregate(
        result
            .overall_eval_metric_results
            .iter()
            .map(|m| m.eval_status),
    );
    result.eval_metric_result_per_invocation = per_invocation;
    Ok(result)
}

impl ServiceInner {
    fn resolve_evaluate_options(&self, overrides: Vec<EvalOption>) -> Result<Options> {
        let opts = self.defaults.apply(overrides);
        opts.validate_evaluation()?;
        if opts.parallel_evaluation {
            EvaluationStage::ensure_pool(self, &opts)?;
        }
        Ok(opts)
    }
}

pub(crate) async fn evaluate(
    svc: &Arc<ServiceInner>,
    ctx: &EvalContext,
    mut request: EvaluateRequest,
    overrides: Vec<EvalOption>,
) -> Result<Vec<EvalCaseResult>> {
    request
        .validate()
        .map_err(|e| e.context("validate evaluate request"))?;
    let opts = svc.resolve_evaluate_options(overrides)?;
    let callbacks = opts.callbacks();

    let before = callbacks.run_before_evaluate_set(ctx, &mut request).await;
    let ctx = before.map_err(|e| {
        e.context(format!(
            "run before evaluate set callbacks (app={}, eval_set_id={})",
            request.app_name, request.eval_set_id
        ))
    })?;

    let start_time = Utc::now();
    let started = Instant::now();
    info!(
        app = %request.app_name,
        eval_set_id = %request.eval_set_id,
        cases = request.inference_results.len(),
        parallel = opts.parallel_evaluation,
        "evaluation started"
    );

    let (results, error) = match evaluate_cases(svc, &ctx, &request, opts).await {
        Ok(results) => (results, None),
        Err(err) => (Vec::new(), Some(err)),
    };

    let after = AfterEvaluateSetArgs {
        request: &request,
        results: &results,
        error: error.as_ref(),
        start_time,
    };
    if let Err(after_err) = callbacks.run_after_evaluate_set(&ctx, &after).await {
        return Err(after_err.context(format!(
            "run after evaluate set callbacks (app={}, eval_set_id={})",
            request.app_name, request.eval_set_id
        )));
    }
    if let Some(err) = error {
        return Err(err);
    }

    info!(
        app = %request.app_name,
        eval_set_id = %request.eval_set_id,
        passed = results.iter().filter(|r| r.final_eval_status == EvalStatus::Passed).count(),
        failed = results.iter().filter(|r| r.final_eval_status == EvalStatus::Failed).count(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "evaluation finished"
    );
    Ok(results)
}

async fn evaluate_cases(
    svc: &Arc<ServiceInner>,
    ctx: &EvalContext,
    request: &EvaluateRequest,
    opts: Options,
) -> Result<Vec<EvalCaseResult>> {
    if request.inference_results.is_empty() {
        return Ok(Vec::new());
    }
    let source = opts
        .case_source
        .clone()
        .ok_or_else(|| EvalError::Configuration("case source is nil".to_string()))?;
    let set = source
        .get(ctx, &request.app_name, &request.eval_set_id)
        .await
        .map_err(|e| e.context("load evaluate eval set"))?;

    let items: Vec<EvaluationItem> = request
        .inference_results
        .iter()
        .map(|inference| EvaluationItem {
            inference: inference.clone(),
            eval_case: set.case(&inference.eval_case_id).cloned(),
        })
        .collect();

    if opts.parallel_evaluation {
        Ok(run_parallel::<EvaluationStage>(svc, ctx, Arc::new(request.clone()), items, Arc::new(opts)).await)
    } else {
        Ok(run_serial::<EvaluationStage>(svc, ctx, request, &items, &opts).await)
    }
}
