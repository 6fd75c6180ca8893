use super::*;
use async_trait::async_trait;
use futures::stream;
use serde_json::{Map, json};
use std::sync::Mutex;
use std::time::Duration;

use crate::evalset::{EvalSet, InMemoryCaseSource, Message, SessionInput};
use crate::runtime::{AgentEvent, EventStream, RunOption, RunOptions};

const APP: &str = "echo-app";
const SET: &str = "echo-set";

#[derive(Debug, Clone)]
struct Call {
    session_id: String,
    message: String,
    options: RunOptions,
}

/// Answers every message with `echo: <message>`.
///
/// `fail` errors, `panic` panics and messages starting with `slow` take 150ms.
#[derive(Default)]
struct Probe {
    jitter: bool,
    calls: Mutex<Vec<Call>>,
}

impl Probe {
    fn jittered() -> Self {
        Self {
            jitter: true,
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRuntime for Probe {
    async fn run(
        &self,
        ctx: &EvalContext,
        _user_id: &str,
        session_id: &str,
        message: Message,
        options: RunOptions,
    ) -> Result<EventStream> {
        self.calls.lock().unwrap().push(Call {
            session_id: session_id.to_string(),
            message: message.content.clone(),
            options,
        });

        let delay = if message.content.starts_with("slow") {
            Duration::from_millis(150)
        } else if self.jitter {
            let spread = message.content.bytes().map(u64::from).sum::<u64>() * 13 % 17;
            Duration::from_millis(spread)
        } else {
            Duration::ZERO
        };
        if !delay.is_zero() {
            tokio::select! {
                reason = ctx.done() => return Err(reason),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match message.content.as_str() {
            "fail" => Err(EvalError::Runtime("no answer".to_string())),
            "panic" => panic!("runtime exploded"),
            content => Ok(Box::pin(stream::iter(vec![AgentEvent::FinalResponse {
                message: Message::assistant(format!("echo: {}", content)),
            }]))),
        }
    }
}

fn echo_case(id: &str, question: &str) -> EvalCase {
    EvalCase::new(id, "user-1").with_invocation(
        Invocation::from_user(question).with_final_response(format!("echo: {}", question)),
    )
}

fn numbered_set(n: usize) -> EvalSet {
    (1..=n).fold(EvalSet::new(SET), |set, i| {
        set.with_case(echo_case(&format!("case-{}", i), &format!("question {}", i)))
    })
}

fn source_with(set: EvalSet) -> Arc<InMemoryCaseSource> {
    let source = Arc::new(InMemoryCaseSource::new());
    source.put(APP, set).unwrap();
    source
}

fn service(
    runtime: Arc<Probe>,
    set: EvalSet,
    options: impl IntoIterator<Item = EvalOption>,
) -> LocalEvalService {
    let source = source_with(set);
    let options: Vec<EvalOption> = std::iter::once(with_case_source(source))
        .chain(options)
        .collect();
    LocalEvalService::new(runtime, options).unwrap()
}

fn ids(results: &[InferenceResult]) -> Vec<&str> {
    results.iter().map(|r| r.eval_case_id.as_str()).collect()
}

fn request() -> InferenceRequest {
    InferenceRequest::new(APP, SET)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_results_follow_case_order() {
    let runtime = Arc::new(Probe::jittered());
    let svc = service(
        runtime.clone(),
        numbered_set(24),
        [with_parallel_inference(true), with_case_parallelism(4)],
    );

    let results = svc.infer(&EvalContext::new(), request(), []).await.unwrap();

    let expected: Vec<String> = (1..=24).map(|i| format!("case-{}", i)).collect();
    assert_eq!(ids(&results), expected.iter().map(String::as_str).collect::<Vec<_>>());
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.status, EvalStatus::Passed, "{:?}", result.error_message);
        let inferences = result.inferences.as_ref().unwrap();
        assert_eq!(
            inferences[0].final_text(),
            Some(format!("echo: question {}", i + 1).as_str())
        );
    }
    assert_eq!(runtime.calls().len(), 24);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_serial_and_parallel_agree() {
    let set = numbered_set(6)
        .with_case(echo_case("case-fail", "fail"))
        .with_case(echo_case("case-7", "question 7"));

    let serial = service(Arc::new(Probe::default()), set.clone(), [])
        .infer(&EvalContext::new(), request(), [])
        .await
        .unwrap();
    let parallel = service(
        Arc::new(Probe::jittered()),
        set,
        [with_parallel_inference(true), with_case_parallelism(3)],
    )
    .infer(&EvalContext::new(), request(), [])
    .await
    .unwrap();

    let summary = |results: &[InferenceResult]| -> Vec<(String, EvalStatus)> {
        results
            .iter()
            .map(|r| (r.eval_case_id.clone(), r.status))
            .collect()
    };
    assert_eq!(summary(&serial), summary(&parallel));
    assert_eq!(serial[6].status, EvalStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_and_panicking_cases_are_isolated() {
    let set = EvalSet::new(SET)
        .with_case(echo_case("ok-1", "hello"))
        .with_case(echo_case("boom", "panic"))
        .with_case(echo_case("broken", "fail"))
        .with_case(echo_case("ok-2", "world"));

    for parallel in [false, true] {
        let svc = service(
            Arc::new(Probe::default()),
            set.clone(),
            [with_parallel_inference(parallel), with_case_parallelism(2)],
        );
        let results = svc.infer(&EvalContext::new(), request(), []).await.unwrap();

        assert_eq!(ids(&results), vec!["ok-1", "boom", "broken", "ok-2"]);
        assert_eq!(results[0].status, EvalStatus::Passed);
        assert_eq!(results[3].status, EvalStatus::Passed);

        let panicked = &results[1];
        assert_eq!(panicked.status, EvalStatus::Failed);
        assert!(panicked.inferences.is_none());
        assert!(
            panicked
                .error_message
                .as_deref()
                .unwrap()
                .contains("runtime exploded")
        );

        let failed = &results[2];
        assert_eq!(failed.status, EvalStatus::Failed);
        let message = failed.error_message.as_deref().unwrap();
        assert!(message.contains("inference eval case (eval_case_id=broken"), "{}", message);
        assert!(message.contains("runner run: no answer"), "{}", message);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_params_return_clean_to_the_recycler() {
    let svc = service(
        Arc::new(Probe::jittered()),
        numbered_set(10),
        [with_parallel_inference(true), with_case_parallelism(3)],
    );

    for _ in 0..3 {
        let results = svc.infer(&EvalContext::new(), request(), []).await.unwrap();
        assert_eq!(results.len(), 10);

        let stats = svc.recycler_stats().inference;
        assert_eq!(stats.idle, stats.allocated);
        assert!(stats.allocated >= 1);
        // at most one record per worker plus the one waiting to be submitted
        assert!(stats.allocated <= 4, "{:?}", stats);
    }
    assert_eq!(svc.recycler_stats().evaluation, RecyclerStats::default());
    // idle records hold no reference back to the service
    assert_eq!(Arc::strong_count(&svc.inner), 1);
}

struct NarrowTo(&'static str);

#[async_trait]
impl EvalCallback for NarrowTo {
    async fn before_inference_set(
        &self,
        _ctx: &EvalContext,
        request: &mut InferenceRequest,
    ) -> Result<Option<EvalContext>> {
        request.eval_case_ids = vec![self.0.to_string()];
        Ok(None)
    }
}

#[tokio::test]
async fn test_before_set_hook_rewrites_request() {
    let runtime = Arc::new(Probe::default());
    let svc = service(runtime.clone(), numbered_set(3), []);
    let callbacks = Callbacks::new().register("narrow", Arc::new(NarrowTo("case-2")));

    let results = svc
        .infer(&EvalContext::new(), request(), [with_callbacks(callbacks)])
        .await
        .unwrap();

    assert_eq!(ids(&results), vec!["case-2"]);
    assert_eq!(runtime.calls().len(), 1);
}

#[derive(Default)]
struct CaseHooks {
    fail_before: Option<&'static str>,
    fail_after: Option<&'static str>,
    seen_after: Mutex<Vec<(String, Option<String>, bool)>>,
}

#[async_trait]
impl EvalCallback for CaseHooks {
    async fn before_inference_case(
        &self,
        ctx: &EvalContext,
        args: &BeforeInferenceCaseArgs<'_>,
    ) -> Result<Option<EvalContext>> {
        if self.fail_before == Some(args.eval_case_id) {
            return Err(EvalError::Callback("before hook refused".to_string()));
        }
        Ok(Some(ctx.with_value("traced_case", args.eval_case_id)))
    }

    async fn after_inference_case(
        &self,
        ctx: &EvalContext,
        args: &AfterInferenceCaseArgs<'_>,
    ) -> Result<()> {
        self.seen_after.lock().unwrap().push((
            args.eval_case_id.to_string(),
            ctx.value_str("traced_case").map(str::to_string),
            args.error.is_some(),
        ));
        if self.fail_after == Some(args.eval_case_id) {
            return Err(EvalError::Callback("after hook refused".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_before_case_error_fails_only_that_case() {
    let runtime = Arc::new(Probe::default());
    let hooks = Arc::new(CaseHooks {
        fail_before: Some("case-2"),
        ..Default::default()
    });
    let svc = service(
        runtime.clone(),
        numbered_set(3),
        [with_callbacks(Callbacks::new().register("hooks", hooks.clone()))],
    );

    let results = svc.infer(&EvalContext::new(), request(), []).await.unwrap();

    assert_eq!(results[0].status, EvalStatus::Passed);
    assert_eq!(results[2].status, EvalStatus::Passed);
    let refused = &results[1];
    assert_eq!(refused.status, EvalStatus::Failed);
    let message = refused.error_message.as_deref().unwrap();
    assert!(
        message.starts_with(&format!(
            "run before inference case callbacks (app={}, eval_set_id={}, eval_case_id=case-2, session_id={})",
            APP, SET, refused.session_id
        )),
        "{}",
        message
    );
    assert!(message.ends_with("before hook refused"));

    // the refused case never reached the runtime, yet its after hook still ran
    assert_eq!(runtime.calls().len(), 2);
    let seen = hooks.seen_after.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[1], ("case-2".to_string(), None, true));
}

#[tokio::test]
async fn test_after_case_error_clears_inferences() {
    let hooks = Arc::new(CaseHooks {
        fail_after: Some("case-1"),
        ..Default::default()
    });
    let svc = service(
        Arc::new(Probe::default()),
        numbered_set(2),
        [with_callbacks(Callbacks::new().register("hooks", hooks))],
    );

    let results = svc.infer(&EvalContext::new(), request(), []).await.unwrap();

    let failed = &results[0];
    assert_eq!(failed.status, EvalStatus::Failed);
    assert!(failed.inferences.is_none());
    let message = failed.error_message.as_deref().unwrap();
    assert!(message.contains("run after inference case callbacks (app=echo-app, eval_set_id=echo-set, eval_case_id=case-1)"));
    assert!(message.contains("after hook refused"));
    assert_eq!(results[1].status, EvalStatus::Passed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_before_case_context_reaches_after_case() {
    let hooks = Arc::new(CaseHooks::default());
    let svc = service(
        Arc::new(Probe::jittered()),
        numbered_set(5),
        [
            with_callbacks(Callbacks::new().register("hooks", hooks.clone())),
            with_parallel_inference(true),
            with_case_parallelism(2),
        ],
    );

    svc.infer(&EvalContext::new(), request(), []).await.unwrap();

    let mut seen = hooks.seen_after.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen.len(), 5);
    for (case_id, traced, errored) in seen {
        assert_eq!(traced.as_deref(), Some(case_id.as_str()));
        assert!(!errored);
    }
}

#[tokio::test]
async fn test_call_session_supplier_overrides_default() {
    let runtime = Arc::new(Probe::default());
    let svc = service(
        runtime.clone(),
        numbered_set(2),
        [with_session_id_supplier(|_: &EvalContext| "default-session".to_string())],
    );

    let defaults = svc.infer(&EvalContext::new(), request(), []).await.unwrap();
    assert!(defaults.iter().all(|r| r.session_id == "default-session"));

    let overridden = svc
        .infer(
            &EvalContext::new(),
            request(),
            [with_session_id_supplier(|_: &EvalContext| "call-session".to_string())],
        )
        .await
        .unwrap();
    assert!(overridden.iter().all(|r| r.session_id == "call-session"));
    assert_eq!(runtime.calls().last().unwrap().session_id, "call-session");
}

#[tokio::test]
async fn test_case_validation_failures() {
    let mut no_session = echo_case("no-session", "hi");
    no_session.session_input = None;
    let mut live_with_actual = echo_case("live-actual", "hi");
    live_with_actual.actual_conversation = vec![Invocation::from_user("hi")];

    let set = EvalSet::new(SET)
        .with_case(EvalCase::new("empty", "user-1"))
        .with_case(no_session)
        .with_case(live_with_actual);
    let runtime = Arc::new(Probe::default());
    let results = service(runtime.clone(), set, [])
        .infer(&EvalContext::new(), request(), [])
        .await
        .unwrap();

    let messages: Vec<&str> = results
        .iter()
        .map(|r| r.error_message.as_deref().unwrap())
        .collect();
    assert!(messages[0].ends_with("invocations are empty"));
    assert!(messages[1].ends_with("session input is nil"));
    assert!(messages[2].ends_with("actual conversation is only supported in trace mode"));
    assert!(results.iter().all(|r| r.status == EvalStatus::Failed));
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_trace_mode_skips_the_runtime() {
    let recorded = Invocation::from_user("hi").with_final_response("recorded answer");
    let mut traced = echo_case("traced", "hi").with_mode(EvalMode::Trace);
    traced.actual_conversation = vec![recorded.clone()];
    let mut mismatched = echo_case("mismatched", "hi").with_mode(EvalMode::Trace);
    mismatched.actual_conversation = vec![recorded.clone(), recorded.clone()];

    let runtime = Arc::new(Probe::default());
    let results = service(
        runtime.clone(),
        EvalSet::new(SET).with_case(traced).with_case(mismatched),
        [],
    )
    .infer(&EvalContext::new(), request(), [])
    .await
    .unwrap();

    assert_eq!(results[0].status, EvalStatus::Passed);
    assert_eq!(results[0].eval_mode, EvalMode::Trace);
    assert_eq!(results[0].inferences, Some(vec![recorded]));
    assert!(
        results[1]
            .error_message
            .as_deref()
            .unwrap()
            .ends_with("actual conversation length 2 does not match conversation length 1")
    );
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_run_options_apply_global_then_case() {
    let mut global_state = Map::new();
    global_state.insert("origin".to_string(), json!("global"));
    let mut case = echo_case("seeded", "hi")
        .with_context_message(Message::system("case system"))
        .with_context_message(Message::user("case user"));
    case.session_input = Some(SessionInput::new("user-1").with_state("origin", "case"));

    let runtime = Arc::new(Probe::default());
    let results = service(
        runtime.clone(),
        EvalSet::new(SET).with_case(case),
        [with_run_options(vec![
            RunOption::InjectContextMessages(vec![Message::system("global injected")]),
            RunOption::RuntimeState(global_state),
        ])],
    )
    .infer(&EvalContext::new(), request(), [])
    .await
    .unwrap();

    let options = runtime.calls()[0].options.clone();
    assert_eq!(
        options.injected_context_messages,
        vec![
            Message::system("global injected"),
            Message::system("case system"),
            Message::user("case user"),
        ]
    );
    assert_eq!(options.runtime_state.get("origin"), Some(&json!("case")));

    let produced = &results[0].inferences.as_ref().unwrap()[0];
    assert_eq!(
        produced.context_messages,
        vec![Message::system("case system"), Message::user("case user")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nonblocking_submit_rejects_when_busy() {
    let set = EvalSet::new(SET)
        .with_case(echo_case("first", "slow one"))
        .with_case(echo_case("second", "slow two"))
        .with_case(echo_case("third", "slow three"));
    let svc = service(
        Arc::new(Probe::default()),
        set,
        [
            with_parallel_inference(true),
            with_case_parallelism(1),
            with_nonblocking_submit(true),
            with_session_id_supplier(|_: &EvalContext| "supplied".to_string()),
        ],
    );

    let results = tokio::time::timeout(
        Duration::from_secs(5),
        svc.infer(&EvalContext::new(), request(), []),
    )
    .await
    .expect("batch must not hang")
    .unwrap();

    assert_eq!(results[0].status, EvalStatus::Passed);
    for rejected in &results[1..] {
        assert_eq!(rejected.status, EvalStatus::Failed);
        assert_eq!(rejected.session_id, "supplied");
        let message = rejected.error_message.as_deref().unwrap();
        assert!(
            message.starts_with(&format!(
                "submit inference task for eval case {}",
                rejected.eval_case_id
            )),
            "{}",
            message
        );
        assert!(message.contains("worker pool is overloaded"));
    }
    let stats = svc.recycler_stats().inference;
    assert_eq!(stats.idle, stats.allocated);
}

#[tokio::test]
async fn test_closed_service_rejects_every_case() {
    let svc = service(
        Arc::new(Probe::default()),
        numbered_set(3),
        [with_parallel_inference(true), with_case_parallelism(2)],
    );
    let first = svc.infer(&EvalContext::new(), request(), []).await.unwrap();
    assert!(first.iter().all(|r| r.status == EvalStatus::Passed));

    svc.close();
    let second = svc.infer(&EvalContext::new(), request(), []).await.unwrap();

    assert_eq!(ids(&second), vec!["case-1", "case-2", "case-3"]);
    for result in &second {
        assert_eq!(result.status, EvalStatus::Failed);
        assert!(result.error_message.as_deref().unwrap().contains("worker pool is closed"));
    }
}

#[tokio::test]
async fn test_cancelled_context_fails_every_case() {
    let ctx = EvalContext::new();
    ctx.cancel();
    let runtime = Arc::new(Probe::default());

    let results = service(runtime.clone(), numbered_set(3), [])
        .infer(&ctx, request(), [])
        .await
        .unwrap();

    assert!(results.iter().all(|r| r.status == EvalStatus::Failed));
    assert!(
        results
            .iter()
            .all(|r| r.error_message.as_deref().unwrap().ends_with("context cancelled"))
    );
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_case_timeout_bounds_slow_cases() {
    let set = EvalSet::new(SET)
        .with_case(echo_case("slow", "slow answer"))
        .with_case(echo_case("fast", "quick answer"));

    let results = service(
        Arc::new(Probe::default()),
        set,
        [with_case_timeout(Duration::from_millis(20))],
    )
    .infer(&EvalContext::new(), request(), [])
    .await
    .unwrap();

    assert_eq!(results[0].status, EvalStatus::Failed);
    assert!(
        results[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("context deadline exceeded")
    );
    assert_eq!(results[1].status, EvalStatus::Passed);
}

#[tokio::test]
async fn test_invalid_requests_fail_the_call() {
    let svc = service(Arc::new(Probe::default()), numbered_set(1), []);

    let err = svc
        .infer(&EvalContext::new(), InferenceRequest::new("", SET), [])
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::Context { .. }));
    assert!(err.to_string().contains("app name is empty"));

    let err = svc
        .infer(&EvalContext::new(), InferenceRequest::new(APP, "missing"), [])
        .await
        .unwrap_err();
    assert!(
        err.to_string()
            .starts_with("load inference eval cases: get eval set: not found")
    );

    let mut no_config = EvaluateRequest::new(APP, SET, Vec::new(), Vec::new());
    no_config.evaluate_config = None;
    let err = svc
        .evaluate(&EvalContext::new(), no_config, [])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("evaluate config is nil"));
}

#[tokio::test]
async fn test_parallelism_zero_rejected() {
    let err = LocalEvalService::new(
        Arc::new(Probe::default()),
        [with_parallel_inference(true), with_case_parallelism(0)],
    )
    .unwrap_err();
    assert!(matches!(err, EvalError::Configuration(_)));

    let svc = service(Arc::new(Probe::default()), numbered_set(1), []);
    let err = svc
        .infer(
            &EvalContext::new(),
            request(),
            [with_parallel_inference(true), with_case_parallelism(0)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::Configuration(_)));
}

struct FailAfterSet;

#[async_trait]
impl EvalCallback for FailAfterSet {
    async fn after_inference_set(
        &self,
        _ctx: &EvalContext,
        args: &AfterInferenceSetArgs<'_>,
    ) -> Result<()> {
        assert_eq!(args.results.len(), 2);
        Err(EvalError::Callback("report sink down".to_string()))
    }
}

#[tokio::test]
async fn test_after_set_error_replaces_results() {
    let svc = service(Arc::new(Probe::default()), numbered_set(2), []);
    let callbacks = Callbacks::new().register("report", Arc::new(FailAfterSet));

    let err = svc
        .infer(&EvalContext::new(), request(), [with_callbacks(callbacks)])
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "run after inference set callbacks (app=echo-app, eval_set_id=echo-set): report sink down"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_evaluate_scores_inference_results() {
    let mut drifted = echo_case("drifted", "question x");
    drifted.conversation[0].final_response = Some(Message::assistant("something else"));
    let set = numbered_set(2)
        .with_case(drifted)
        .with_case(echo_case("broken", "fail"));

    for parallel in [false, true] {
        let svc = service(
            Arc::new(Probe::default()),
            set.clone(),
            [with_parallel_evaluation(parallel), with_case_parallelism(2)],
        );
        let ctx = EvalContext::new();
        let inferences = svc.infer(&ctx, request(), []).await.unwrap();

        let scored = svc
            .evaluate(
                &ctx,
                EvaluateRequest::new(
                    APP,
                    SET,
                    inferences,
                    vec![
                        EvalMetric::new("final_response_match", 1.0),
                        EvalMetric::new("tool_trajectory_match", 1.0),
                    ],
                ),
                [],
            )
            .await
            .unwrap();

        let statuses: Vec<(&str, EvalStatus)> = scored
            .iter()
            .map(|r| (r.eval_id.as_str(), r.final_eval_status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("case-1", EvalStatus::Passed),
                ("case-2", EvalStatus::Passed),
                ("drifted", EvalStatus::Failed),
                ("broken", EvalStatus::Failed),
            ]
        );

        let passed = &scored[0];
        assert_eq!(passed.overall_eval_metric_results.len(), 2);
        assert_eq!(passed.overall_eval_metric_results[0].score, Some(1.0));
        assert_eq!(passed.eval_metric_result_per_invocation.len(), 1);
        assert_eq!(
            passed.eval_metric_result_per_invocation[0].eval_metric_results.len(),
            2
        );

        let drifted = &scored[2];
        assert_eq!(drifted.overall_eval_metric_results[0].score, Some(0.0));
        assert_eq!(
            drifted.overall_eval_metric_results[1].eval_status,
            EvalStatus::Passed
        );

        let broken = &scored[3];
        assert!(
            broken
                .error_message
                .as_deref()
                .unwrap()
                .contains("inference failed: ")
        );
    }
}

#[tokio::test]
async fn test_unknown_metric_fails_each_case() {
    let svc = service(Arc::new(Probe::default()), numbered_set(2), []);
    let ctx = EvalContext::new();
    let inferences = svc.infer(&ctx, request(), []).await.unwrap();

    let scored = svc
        .evaluate(
            &ctx,
            EvaluateRequest::new(APP, SET, inferences, vec![EvalMetric::new("bleu", 0.5)]),
            [],
        )
        .await
        .unwrap();

    assert_eq!(scored.len(), 2);
    for result in &scored {
        assert_eq!(result.final_eval_status, EvalStatus::Failed);
        let message = result.error_message.as_deref().unwrap();
        assert!(message.starts_with("evaluate eval case (eval_case_id="));
        assert!(message.contains("bleu"));
    }
}

#[tokio::test]
async fn test_evaluate_empty_batch_returns_nothing() {
    let svc = service(Arc::new(Probe::default()), numbered_set(1), []);
    let scored = svc
        .evaluate(
            &EvalContext::new(),
            EvaluateRequest::new(APP, "never-loaded", Vec::new(), Vec::new()),
            [],
        )
        .await
        .unwrap();
    assert!(scored.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_session_supplier_fails_each_case() {
    for parallel in [false, true] {
        let runtime = Arc::new(Probe::default());
        let svc = service(
            runtime.clone(),
            numbered_set(3),
            [
                with_parallel_inference(parallel),
                with_case_parallelism(2),
                with_session_id_supplier(|_: &EvalContext| -> String {
                    panic!("supplier exploded")
                }),
            ],
        );

        let results = tokio::time::timeout(
            Duration::from_secs(5),
            svc.infer(&EvalContext::new(), request(), []),
        )
        .await
        .expect("batch must not hang")
        .unwrap();

        assert_eq!(ids(&results), vec!["case-1", "case-2", "case-3"]);
        for result in &results {
            assert_eq!(result.status, EvalStatus::Failed);
            assert!(result.inferences.is_none());
            assert!(result.session_id.is_empty());
            assert!(
                result
                    .error_message
                    .as_deref()
                    .unwrap()
                    .contains("supplier exploded")
            );
        }
        assert!(runtime.calls().is_empty());
        let stats = svc.recycler_stats().inference;
        assert_eq!(stats.idle, stats.allocated);
    }
}

#[derive(Default)]
struct SetHooks {
    refuse_before: bool,
    after_calls: Mutex<usize>,
}

#[async_trait]
impl EvalCallback for SetHooks {
    async fn before_inference_set(
        &self,
        _ctx: &EvalContext,
        _request: &mut InferenceRequest,
    ) -> Result<Option<EvalContext>> {
        if self.refuse_before {
            return Err(EvalError::Callback("quota exhausted".to_string()));
        }
        Ok(None)
    }

    async fn after_inference_set(
        &self,
        _ctx: &EvalContext,
        _args: &AfterInferenceSetArgs<'_>,
    ) -> Result<()> {
        *self.after_calls.lock().unwrap() += 1;
        Ok(())
    }

    async fn before_evaluate_set(
        &self,
        _ctx: &EvalContext,
        _request: &mut EvaluateRequest,
    ) -> Result<Option<EvalContext>> {
        if self.refuse_before {
            return Err(EvalError::Callback("quota exhausted".to_string()));
        }
        Ok(None)
    }

    async fn after_evaluate_set(
        &self,
        _ctx: &EvalContext,
        args: &AfterEvaluateSetArgs<'_>,
    ) -> Result<()> {
        *self.after_calls.lock().unwrap() += 1;
        if !self.refuse_before && args.results.len() == 2 {
            return Err(EvalError::Callback("report sink down".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_before_set_error_stops_the_batch() {
    let runtime = Arc::new(Probe::default());
    let svc = service(runtime.clone(), numbered_set(3), []);
    let hooks = Arc::new(SetHooks {
        refuse_before: true,
        ..Default::default()
    });
    let callbacks = Callbacks::new().register("quota", hooks.clone());

    let err = svc
        .infer(&EvalContext::new(), request(), [with_callbacks(callbacks.clone())])
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "run before inference set callbacks (app=echo-app, eval_set_id=echo-set): quota exhausted"
    );
    assert!(runtime.calls().is_empty());
    assert_eq!(*hooks.after_calls.lock().unwrap(), 0);

    let err = svc
        .evaluate(
            &EvalContext::new(),
            EvaluateRequest::new(APP, SET, Vec::new(), vec![EvalMetric::new("final_response_match", 1.0)]),
            [with_callbacks(callbacks)],
        )
        .await
        .unwrap_err();
    assert!(
        err.to_string()
            .starts_with("run before evaluate set callbacks (app=echo-app, eval_set_id=echo-set)")
    );
    assert_eq!(*hooks.after_calls.lock().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_mid_batch_stops_in_flight_cases() {
    let set = EvalSet::new(SET)
        .with_case(echo_case("fast", "quick"))
        .with_case(echo_case("s1", "slow a"))
        .with_case(echo_case("s2", "slow b"));
    let svc = service(
        Arc::new(Probe::default()),
        set,
        [with_parallel_inference(true), with_case_parallelism(3)],
    );

    let ctx = EvalContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let results = svc.infer(&ctx, request(), []).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(150), "{:?}", started.elapsed());
    assert_eq!(ids(&results), vec!["fast", "s1", "s2"]);
    assert_eq!(results[0].status, EvalStatus::Passed);
    for cancelled in &results[1..] {
        assert_eq!(cancelled.status, EvalStatus::Failed);
        assert!(cancelled.inferences.is_none());
        let message = cancelled.error_message.as_deref().unwrap();
        assert!(message.ends_with("context cancelled"), "{}", message);
    }
}

#[derive(Default)]
struct ScoreHooks {
    fail_before: Option<&'static str>,
    fail_after: Option<&'static str>,
    seen_after: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl EvalCallback for ScoreHooks {
    async fn before_evaluate_case(
        &self,
        _ctx: &EvalContext,
        args: &BeforeEvaluateCaseArgs<'_>,
    ) -> Result<Option<EvalContext>> {
        if self.fail_before == Some(args.eval_case_id) {
            return Err(EvalError::Callback("scorer unavailable".to_string()));
        }
        Ok(None)
    }

    async fn after_evaluate_case(
        &self,
        _ctx: &EvalContext,
        args: &AfterEvaluateCaseArgs<'_>,
    ) -> Result<()> {
        self.seen_after
            .lock()
            .unwrap()
            .push((args.eval_case_id.to_string(), args.error.is_some()));
        if self.fail_after == Some(args.eval_case_id) {
            return Err(EvalError::Callback("audit log full".to_string()));
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_evaluate_case_hooks_isolate_failures() {
    for parallel in [false, true] {
        let svc = service(
            Arc::new(Probe::default()),
            numbered_set(3),
            [with_parallel_evaluation(parallel), with_case_parallelism(2)],
        );
        let ctx = EvalContext::new();
        let inferences = svc.infer(&ctx, request(), []).await.unwrap();

        let hooks = Arc::new(ScoreHooks {
            fail_before: Some("case-2"),
            fail_after: Some("case-3"),
            ..Default::default()
        });
        let scored = svc
            .evaluate(
                &ctx,
                EvaluateRequest::new(
                    APP,
                    SET,
                    inferences,
                    vec![EvalMetric::new("final_response_match", 1.0)],
                ),
                [with_callbacks(Callbacks::new().register("hooks", hooks.clone()))],
            )
            .await
            .unwrap();

        let ids: Vec<&str> = scored.iter().map(|r| r.eval_id.as_str()).collect();
        assert_eq!(ids, vec!["case-1", "case-2", "case-3"]);

        let passed = &scored[0];
        assert_eq!(passed.final_eval_status, EvalStatus::Passed);
        assert_eq!(passed.overall_eval_metric_results.len(), 1);

        let refused = &scored[1];
        assert_eq!(refused.final_eval_status, EvalStatus::Failed);
        let message = refused.error_message.as_deref().unwrap();
        assert_eq!(
            message,
            "run before evaluate case callbacks (app=echo-app, eval_set_id=echo-set, eval_case_id=case-2): scorer unavailable"
        );
        assert!(refused.overall_eval_metric_results.is_empty());

        // scored and passing, then overridden by the after hook
        let audited = &scored[2];
        assert_eq!(audited.final_eval_status, EvalStatus::Failed);
        let message = audited.error_message.as_deref().unwrap();
        assert!(
            message.contains("run after evaluate case callbacks (app=echo-app, eval_set_id=echo-set, eval_case_id=case-3)"),
            "{}",
            message
        );
        assert!(message.ends_with("audit log full"), "{}", message);
        assert!(audited.overall_eval_metric_results.is_empty());
        assert!(audited.eval_metric_result_per_invocation.is_empty());

        let mut seen = hooks.seen_after.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("case-1".to_string(), false),
                ("case-2".to_string(), true),
                ("case-3".to_string(), false),
            ]
        );
    }
}

#[tokio::test]
async fn test_after_evaluate_set_error_replaces_results() {
    let svc = service(Arc::new(Probe::default()), numbered_set(2), []);
    let ctx = EvalContext::new();
    let inferences = svc.infer(&ctx, request(), []).await.unwrap();
    let hooks = Arc::new(SetHooks::default());

    let err = svc
        .evaluate(
            &ctx,
            EvaluateRequest::new(
                APP,
                SET,
                inferences,
                vec![EvalMetric::new("final_response_match", 1.0)],
            ),
            [with_callbacks(Callbacks::new().register("report", hooks.clone()))],
        )
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "run after evaluate set callbacks (app=echo-app, eval_set_id=echo-set): report sink down"
    );
    assert_eq!(*hooks.after_calls.lock().unwrap(), 1);
}
