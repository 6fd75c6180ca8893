//! Fixed-size worker pool
//!
//! `size` long-lived tokio tasks pull work from a shared queue. A semaphore
//! with `size` permits tracks free workers: a submission first takes a permit,
//! and the worker gives it back once the handler returns. In nonblocking mode a
//! submission that finds every worker busy is rejected instead of waiting.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc};
use tracing::{debug, error, warn};

use crate::error::{EvalError, Result};

/// Handler run by a worker for every task
pub(crate) type TaskHandler<T> = Arc<dyn Fn(Box<T>) -> BoxFuture<'static, ()> + Send + Sync>;

type Job<T> = (Box<T>, OwnedSemaphorePermit);

/// A submission the pool refused; the task is handed back
pub(crate) enum SubmitError<T> {
    /// Every worker is busy
    Busy(Box<T>),
    /// The pool is shut down
    Closed(Box<T>),
}

impl<T> SubmitError<T> {
    pub(crate) fn into_task(self) -> Box<T> {
        match self {
            SubmitError::Busy(task) | SubmitError::Closed(task) => task,
        }
    }

    pub(crate) fn reason(&self) -> &'static str {
        match self {
            SubmitError::Busy(_) => "worker pool is overloaded",
            SubmitError::Closed(_) => "worker pool is closed",
        }
    }
}

pub(crate) struct WorkerPool<T> {
    size: usize,
    nonblocking: bool,
    permits: Arc<Semaphore>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job<T>>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `size` workers on the current tokio runtime
    pub(crate) fn new(size: usize, nonblocking: bool, handler: TaskHandler<T>) -> Result<Self> {
        if size == 0 {
            return Err(EvalError::Configuration(
                "worker pool size must be greater than 0".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            EvalError::Configuration(format!("create worker pool: no tokio runtime: {}", e))
        })?;

        let (sender, receiver) = mpsc::unbounded_channel::<Job<T>>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for worker in 0..size {
            let receiver = receiver.clone();
            let handler = handler.clone();
            runtime.spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    let Some((task, permit)) = job else {
                        break;
                    };
                    let run = AssertUnwindSafe(async { (*handler)(task).await });
                    if run.catch_unwind().await.is_err() {
                        error!(worker, "worker task panicked outside case processing");
                    }
                    drop(permit);
                }
                debug!(worker, "worker stopped");
            });
        }

        debug!(size, nonblocking, "worker pool started");
        Ok(Self {
            size,
            nonblocking,
            permits: Arc::new(Semaphore::new(size)),
            sender: Mutex::new(Some(sender)),
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Hand a task to a free worker
    pub(crate) async fn submit(&self, task: Box<T>) -> std::result::Result<(), SubmitError<T>> {
        let permit = if self.nonblocking {
            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => return Err(SubmitError::Busy(task)),
                Err(TryAcquireError::Closed) => return Err(SubmitError::Closed(task)),
            }
        } else {
            match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Err(SubmitError::Closed(task)),
            }
        };

        let sender = self.sender.lock().ok().and_then(|sender| sender.clone());
        let Some(sender) = sender else {
            return Err(SubmitError::Closed(task));
        };
        sender
            .send((task, permit))
            .map_err(|rejected| SubmitError::Closed((rejected.0).0))
    }

    /// Stop accepting work; queued tasks still run
    pub(crate) fn close(&self) {
        self.permits.close();
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.permits.close();
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

/// A pool created on first use and reused for the life of its owner.
///
/// The first outcome is cached, failure included. A later request for a
/// different size is served by the original pool.
pub(crate) struct MemoizedPool<T> {
    cell: OnceLock<std::result::Result<Arc<WorkerPool<T>>, String>>,
}

impl<T: Send + 'static> MemoizedPool<T> {
    pub(crate) fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Get the pool, creating it with `size` workers on first use
    pub(crate) fn ensure(
        &self,
        size: usize,
        nonblocking: bool,
        handler: impl FnOnce() -> TaskHandler<T>,
    ) -> Result<Arc<WorkerPool<T>>> {
        let created = self.cell.get_or_init(|| {
            WorkerPool::new(size, nonblocking, handler())
                .map(Arc::new)
                .map_err(|e| e.to_string())
        });
        match created {
            Ok(pool) => {
                if pool.size() != size {
                    warn!(
                        requested = size,
                        actual = pool.size(),
                        "worker pool already created, ignoring new parallelism"
                    );
                }
                Ok(pool.clone())
            }
            Err(message) => Err(EvalError::Configuration(message.clone())),
        }
    }

    pub(crate) fn close(&self) {
        if let Some(Ok(pool)) = self.cell.get() {
            pool.close();
        }
    }
}
