//! Batch executor shared by the inference and scoring stages
//!
//! A stage ([`CaseStage`]) knows how to process one item into one output and
//! how to describe a failure. The executor runs items either inline, in order,
//! or on the stage's worker pool.
//!
//! Parallel batches scatter and gather: the result array is sized before the
//! first submission and task `i` writes only slot `i`. Every task signals the
//! completion barrier exactly once, from a drop guard, after its slot is written
//! and its parameter has gone back to the recycler. Rejected submissions take
//! the same path synchronously.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;
use tracing::{error, warn};

use super::options::Options;
use super::pool::{MemoizedPool, TaskHandler};
use super::recycler::{ParamRecycler, Recyclable};
use super::ServiceInner;
use crate::context::EvalContext;
use crate::error::EvalError;

/// Per-case pipeline run by the executor
#[async_trait]
pub(crate) trait CaseStage: Sized + Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Item: Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Stage name used in logs and rejection messages
    const NAME: &'static str;

    /// Session the case runs under; may call user code
    fn session_id(item: &Self::Item, opts: &Options, ctx: &EvalContext) -> String;

    /// Run the whole per-case pipeline; failures are folded into the output
    async fn process(
        svc: &ServiceInner,
        ctx: &EvalContext,
        request: &Self::Request,
        item: &Self::Item,
        opts: &Options,
        session_id: &str,
    ) -> Self::Output;

    /// Output describing a case that failed outside `process`.
    /// Must not call user code: it runs on panic recovery and drop paths.
    fn failed(
        request: &Self::Request,
        item: &Self::Item,
        session_id: Option<&str>,
        err: EvalError,
    ) -> Self::Output;

    fn case_id(item: &Self::Item) -> &str;

    fn pool(svc: &ServiceInner) -> &MemoizedPool<TaskParam<Self>>;

    fn recycler(svc: &ServiceInner) -> &ParamRecycler<TaskParam<Self>>;

    /// Get or create the stage's worker pool
    fn ensure_pool(
        svc: &ServiceInner,
        opts: &Options,
    ) -> crate::error::Result<Arc<super::pool::WorkerPool<TaskParam<Self>>>> {
        Self::pool(svc).ensure(opts.case_parallelism, opts.nonblocking_submit, || {
            task_handler::<Self>()
        })
    }
}

/// Pre-sized result array written once per slot
pub(crate) struct ResultSlots<R> {
    slots: Vec<OnceLock<R>>,
}

impl<R> ResultSlots<R> {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Write slot `idx`; later writes to the same slot are ignored
    pub(crate) fn set(&self, idx: usize, value: R) -> bool {
        self.slots
            .get(idx)
            .map(|slot| slot.set(value).is_ok())
            .unwrap_or(false)
    }

    pub(crate) fn is_set(&self, idx: usize) -> bool {
        self.slots
            .get(idx)
            .map(|slot| slot.get().is_some())
            .unwrap_or(false)
    }
}

impl<R: Clone> ResultSlots<R> {
    /// Take the values out, cloning only if other owners remain
    pub(crate) fn into_vec(self: Arc<Self>) -> Vec<Option<R>> {
        match Arc::try_unwrap(self) {
            Ok(slots) => slots.slots.into_iter().map(OnceLock::into_inner).collect(),
            Err(shared) => shared.slots.iter().map(|slot| slot.get().cloned()).collect(),
        }
    }
}

/// Counts outstanding tasks and wakes the waiter when the count reaches zero
pub(crate) struct CompletionBarrier {
    pending: AtomicUsize,
    notify: Notify,
}

impl CompletionBarrier {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub(crate) fn add(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn done(&self) {
        match self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.notify.notify_one(),
            Ok(_) => {}
            Err(_) => error!("completion barrier signalled more often than tasks were added"),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until every added task is done
    pub(crate) async fn wait(&self) {
        while self.pending() != 0 {
            self.notify.notified().await;
        }
    }
}

/// Recyclable parameters of one parallel case task
pub(crate) struct TaskParam<S: CaseStage> {
    pub(crate) idx: usize,
    pub(crate) ctx: Option<EvalContext>,
    pub(crate) request: Option<Arc<S::Request>>,
    pub(crate) item: Option<Arc<S::Item>>,
    pub(crate) opts: Option<Arc<Options>>,
    pub(crate) svc: Option<Arc<ServiceInner>>,
    pub(crate) results: Option<Arc<ResultSlots<S::Output>>>,
    pub(crate) barrier: Option<Arc<CompletionBarrier>>,
    pub(crate) session_id: Option<String>,
}

impl<S: CaseStage> Default for TaskParam<S> {
    fn default() -> Self {
        Self {
            idx: 0,
            ctx: None,
            request: None,
            item: None,
            opts: None,
            svc: None,
            results: None,
            barrier: None,
            session_id: None,
        }
    }
}

impl<S: CaseStage> Recyclable for TaskParam<S> {
    fn reset(&mut self) {
        self.idx = 0;
        self.ctx = None;
        self.request = None;
        self.item = None;
        self.opts = None;
        self.svc = None;
        self.results = None;
        self.barrier = None;
        self.session_id = None;
    }

    fn is_reset(&self) -> bool {
        self.idx == 0
            && self.ctx.is_none()
            && self.request.is_none()
            && self.item.is_none()
            && self.opts.is_none()
            && self.svc.is_none()
            && self.results.is_none()
            && self.barrier.is_none()
            && self.session_id.is_none()
    }
}

/// Finishes a task on every exit path: fallback result, recycle, then signal
struct TaskGuard<S: CaseStage> {
    param: Option<Box<TaskParam<S>>>,
}

impl<S: CaseStage> Drop for TaskGuard<S> {
    fn drop(&mut self) {
        let Some(mut param) = self.param.take() else {
            return;
        };
        if let (Some(results), Some(request), Some(item)) = (
            param.results.as_ref(),
            param.request.as_ref(),
            param.item.as_ref(),
        ) {
            if !results.is_set(param.idx) {
                let err = EvalError::Panicked("case task ended without a result".to_string());
                let output = S::failed(request, item, param.session_id.as_deref(), err);
                results.set(param.idx, output);
            }
        }

        let barrier = param.barrier.take();
        match param.svc.take() {
            Some(svc) => S::recycler(&svc).release(param),
            None => drop(param),
        }
        if let Some(barrier) = barrier {
            barrier.done();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one case, turning a panic into a failed output.
///
/// The session id is resolved inside the caught region and recorded in
/// `session_id` so recovery never calls the supplier again.
async fn process_caught<S: CaseStage>(
    svc: &ServiceInner,
    ctx: &EvalContext,
    request: &S::Request,
    item: &S::Item,
    opts: &Options,
    session_id: &mut Option<String>,
) -> S::Output {
    let caught = AssertUnwindSafe(async {
        let session_id: &str = session_id.insert(S::session_id(item, opts, ctx));
        S::process(svc, ctx, request, item, opts, session_id).await
    })
    .catch_unwind()
    .await;

    match caught {
        Ok(output) => output,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(stage = S::NAME, case = S::case_id(item), %message, "recovered panic in case processing");
            S::failed(request, item, session_id.as_deref(), EvalError::Panicked(message))
        }
    }
}

/// Resolve a session id for a case that never reached a worker
fn session_id_caught<S: CaseStage>(
    item: &S::Item,
    opts: &Options,
    ctx: &EvalContext,
) -> Option<String> {
    std::panic::catch_unwind(AssertUnwindSafe(|| S::session_id(item, opts, ctx))).ok()
}

/// Worker entry point for one task
async fn run_task<S: CaseStage>(param: Box<TaskParam<S>>) {
    let mut guard = TaskGuard::<S> { param: Some(param) };
    let Some(param) = guard.param.as_deref_mut() else {
        return;
    };
    let TaskParam {
        idx,
        ctx,
        request,
        item,
        opts,
        svc,
        results,
        session_id,
        ..
    } = param;
    let (Some(ctx), Some(request), Some(item), Some(opts), Some(svc), Some(results)) = (
        ctx.as_ref(),
        request.as_ref(),
        item.as_ref(),
        opts.as_ref(),
        svc.as_ref(),
        results.as_ref(),
    ) else {
        error!(stage = S::NAME, idx = *idx, "task parameter is incomplete");
        return;
    };

    let output = process_caught::<S>(svc, ctx, request, item, opts, session_id).await;
    results.set(*idx, output);
}

pub(crate) fn task_handler<S: CaseStage>() -> TaskHandler<TaskParam<S>> {
    Arc::new(|param: Box<TaskParam<S>>| -> BoxFuture<'static, ()> { Box::pin(run_task::<S>(param)) })
}

/// Process items one after another, in order
pub(crate) async fn run_serial<S: CaseStage>(
    svc: &ServiceInner,
    ctx: &EvalContext,
    request: &S::Request,
    items: &[S::Item],
    opts: &Options,
) -> Vec<S::Output> {
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let mut session_id = None;
        results.push(process_caught::<S>(svc, ctx, request, item, opts, &mut session_id).await);
    }
    results
}

/// Process items on the stage's worker pool; output `i` belongs to item `i`
pub(crate) async fn run_parallel<S: CaseStage>(
    svc: &Arc<ServiceInner>,
    ctx: &EvalContext,
    request: Arc<S::Request>,
    items: Vec<S::Item>,
    opts: Arc<Options>,
) -> Vec<S::Output> {
    let items: Vec<Arc<S::Item>> = items.into_iter().map(Arc::new).collect();
    let results = Arc::new(ResultSlots::<S::Output>::new(items.len()));
    let barrier = Arc::new(CompletionBarrier::new());
    barrier.add(items.len());

    let pool = S::ensure_pool(svc, &opts);
    let recycler = S::recycler(svc);

    for (idx, item) in items.iter().enumerate() {
        let pool = match pool.as_ref() {
            Ok(pool) => pool,
            Err(err) => {
                let err = EvalError::Rejected(err.to_string());
                reject::<S>(&results, &barrier, idx, &request, item, &opts, ctx, err);
                continue;
            }
        };

        let mut param = recycler.acquire();
        param.idx = idx;
        param.ctx = Some(ctx.clone());
        param.request = Some(request.clone());
        param.item = Some(item.clone());
        param.opts = Some(opts.clone());
        param.svc = Some(svc.clone());
        param.results = Some(results.clone());
        param.barrier = Some(barrier.clone());

        if let Err(rejected) = pool.submit(param).await {
            let err = EvalError::Rejected(rejected.reason().to_string());
            recycler.release(rejected.into_task());
            reject::<S>(&results, &barrier, idx, &request, item, &opts, ctx, err);
        }
    }

    barrier.wait().await;

    results
        .into_vec()
        .into_iter()
        .zip(items.iter())
        .map(|(output, item)| {
            output.unwrap_or_else(|| {
                S::failed(
                    &request,
                    item,
                    None,
                    EvalError::Other("case result was never written".to_string()),
                )
            })
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn reject<S: CaseStage>(
    results: &ResultSlots<S::Output>,
    barrier: &CompletionBarrier,
    idx: usize,
    request: &S::Request,
    item: &S::Item,
    opts: &Options,
    ctx: &EvalContext,
    err: EvalError,
) {
    warn!(stage = S::NAME, case = S::case_id(item), error = %err, "case submission rejected");
    let err = err.context(format!(
        "submit {} task for eval case {}",
        S::NAME,
        S::case_id(item)
    ));
    let session_id = session_id_caught::<S>(item, opts, ctx);
    results.set(idx, S::failed(request, item, session_id.as_deref(), err));
    barrier.done();
}
