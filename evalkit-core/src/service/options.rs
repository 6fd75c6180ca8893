//! Service defaults and call-scoped overrides
//!
//! [`Options`] holds everything a batch needs besides the request. The service
//! stores one set of defaults; each call may pass [`EvalOption`] mutators that
//! are applied left to right on a copy of them.

use std::sync::Arc;
use std::time::Duration;

use crate::context::EvalContext;
use crate::error::{EvalError, Result};
use crate::evalset::CaseSource;
use crate::evaluator::Registry;
use crate::runtime::RunOption;

use super::callbacks::Callbacks;

/// Produces the session id for one case
pub type SessionIdSupplier = Arc<dyn Fn(&EvalContext) -> String + Send + Sync>;

/// A configuration mutator
pub type EvalOption = Box<dyn FnOnce(Options) -> Options + Send>;

/// Effective configuration of one batch
#[derive(Clone)]
pub struct Options {
    pub case_source: Option<Arc<dyn CaseSource>>,
    pub session_id_supplier: Option<SessionIdSupplier>,
    pub run_options: Vec<RunOption>,
    pub callbacks: Option<Arc<Callbacks>>,
    pub registry: Option<Arc<Registry>>,
    pub case_parallelism: usize,
    pub parallel_inference: bool,
    pub parallel_evaluation: bool,
    pub nonblocking_submit: bool,
    pub case_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            case_source: None,
            session_id_supplier: Some(Arc::new(|_: &EvalContext| {
                uuid::Uuid::new_v4().to_string()
            })),
            run_options: Vec::new(),
            callbacks: None,
            registry: Some(Arc::new(Registry::with_builtins())),
            case_parallelism: default_parallelism(),
            parallel_inference: false,
            parallel_evaluation: false,
            nonblocking_submit: false,
            case_timeout: None,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("case_source", &self.case_source.is_some())
            .field("session_id_supplier", &self.session_id_supplier.is_some())
            .field("run_options", &self.run_options.len())
            .field("callbacks", &self.callbacks)
            .field("case_parallelism", &self.case_parallelism)
            .field("parallel_inference", &self.parallel_inference)
            .field("parallel_evaluation", &self.parallel_evaluation)
            .field("nonblocking_submit", &self.nonblocking_submit)
            .field("case_timeout", &self.case_timeout)
            .finish()
    }
}

pub(crate) fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Options {
    /// Apply mutators to a copy of these options, in order
    pub fn apply(&self, overrides: impl IntoIterator<Item = EvalOption>) -> Options {
        overrides
            .into_iter()
            .fold(self.clone(), |options, apply| apply(options))
    }

    /// Validate for the inference stage
    pub(crate) fn validate_inference(&self) -> Result<()> {
        if self.case_source.is_none() {
            return Err(EvalError::Configuration("case source is nil".to_string()));
        }
        if self.session_id_supplier.is_none() {
            return Err(EvalError::Configuration(
                "session id supplier is nil".to_string(),
            ));
        }
        if self.parallel_inference {
            self.validate_parallelism()?;
        }
        Ok(())
    }

    /// Validate for the scoring stage
    pub(crate) fn validate_evaluation(&self) -> Result<()> {
        if self.case_source.is_none() {
            return Err(EvalError::Configuration("case source is nil".to_string()));
        }
        if self.registry.is_none() {
            return Err(EvalError::Configuration("registry is nil".to_string()));
        }
        if self.parallel_evaluation {
            self.validate_parallelism()?;
        }
        Ok(())
    }

    fn validate_parallelism(&self) -> Result<()> {
        if self.case_parallelism == 0 {
            return Err(EvalError::Configuration(
                "eval case parallelism must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Session id for a case, from the configured supplier
    pub(crate) fn session_id(&self, ctx: &EvalContext) -> String {
        self.session_id_supplier
            .as_ref()
            .map(|supplier| supplier(ctx))
            .unwrap_or_default()
    }

    /// Context a single case runs under
    pub(crate) fn case_context(&self, ctx: &EvalContext) -> EvalContext {
        match self.case_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        }
    }

    pub(crate) fn callbacks(&self) -> Arc<Callbacks> {
        self.callbacks.clone().unwrap_or_default()
    }
}

/// Use `source` to load eval sets
pub fn with_case_source(source: Arc<dyn CaseSource>) -> EvalOption {
    Box::new(move |mut o: Options| {
        o.case_source = Some(source);
        o
    })
}

/// Derive session ids with `supplier`
pub fn with_session_id_supplier(
    supplier: impl Fn(&EvalContext) -> String + Send + Sync + 'static,
) -> EvalOption {
    Box::new(move |mut o: Options| {
        o.session_id_supplier = Some(Arc::new(supplier));
        o
    })
}

/// Append run-time overrides applied to every runtime call
pub fn with_run_options(run_options: Vec<RunOption>) -> EvalOption {
    Box::new(move |mut o: Options| {
        o.run_options.extend(run_options);
        o
    })
}

/// Replace the callback chain
pub fn with_callbacks(callbacks: Callbacks) -> EvalOption {
    let callbacks = Arc::new(callbacks);
    Box::new(move |mut o: Options| {
        o.callbacks = Some(callbacks);
        o
    })
}

/// Replace the evaluator registry
pub fn with_registry(registry: Arc<Registry>) -> EvalOption {
    Box::new(move |mut o: Options| {
        o.registry = Some(registry);
        o
    })
}

/// Number of workers in each parallel pool
pub fn with_case_parallelism(parallelism: usize) -> EvalOption {
    Box::new(move |mut o: Options| {
        o.case_parallelism = parallelism;
        o
    })
}

/// Run inference cases on the worker pool
pub fn with_parallel_inference(enabled: bool) -> EvalOption {
    Box::new(move |mut o: Options| {
        o.parallel_inference = enabled;
        o
    })
}

/// Run scoring cases on the worker pool
pub fn with_parallel_evaluation(enabled: bool) -> EvalOption {
    Box::new(move |mut o: Options| {
        o.parallel_evaluation = enabled;
        o
    })
}

/// Reject submissions instead of waiting when every worker is busy
pub fn with_nonblocking_submit(enabled: bool) -> EvalOption {
    Box::new(move |mut o: Options| {
        o.nonblocking_submit = enabled;
        o
    })
}

/// Bound each case by a deadline
pub fn with_case_timeout(timeout: Duration) -> EvalOption {
    Box::new(move |mut o: Options| {
        o.case_timeout = Some(timeout);
        o
    })
}
