//! # Evalkit - Evaluation engine for conversational agents
//!
//! Evalkit replays recorded eval cases against an agent runtime, captures what
//! the agent produced, and scores it with pluggable metrics:
//! - Eval sets of multi-turn cases, loaded from JSON or YAML
//! - Live and trace evaluation modes
//! - Serial or pooled parallel execution with ordered, isolated results
//! - Callback hooks around every batch and every case
//! - A registry of metric evaluators
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use evalkit_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let set = EvalSet::load("evalsets/math.json")?;
//!     let source = Arc::new(InMemoryCaseSource::new());
//!     let runtime = Arc::new(ReplayRuntime::from_set(&set));
//!     source.put("math-agent", set)?;
//!
//!     let config = EvalServiceConfig::load()?;
//!     let service = LocalEvalService::from_config(runtime, &config, [with_case_source(source)])?;
//!
//!     let ctx = EvalContext::new();
//!     let inferences = service
//!         .infer(&ctx, InferenceRequest::new("math-agent", "math"), [])
//!         .await?;
//!     let scored = service
//!         .evaluate(
//!             &ctx,
//!             EvaluateRequest::new(
//!                 "math-agent",
//!                 "math",
//!                 inferences,
//!                 vec![EvalMetric::new("final_response_match", 1.0)],
//!             ),
//!             [],
//!         )
//!         .await?;
//!     println!("{} cases scored", scored.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **evalset**: cases, sets and the [`evalset::CaseSource`] contract
//! - **runtime**: the [`runtime::AgentRuntime`] contract and a replay runtime
//! - **evaluator**: metric evaluators and their registry
//! - **service**: the two-stage engine, its worker pools and callbacks

pub mod config;
pub mod context;
pub mod error;
pub mod evalset;
pub mod evaluator;
pub mod runtime;
pub mod service;
pub mod status;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::EvalServiceConfig;
    pub use crate::context::EvalContext;
    pub use crate::error::{EvalError, Result};
    pub use crate::evalset::{
        CaseSource, EvalCase, EvalMode, EvalSet, InMemoryCaseSource, Invocation, Message,
        MessageRole, SessionInput, ToolUse,
    };
    pub use crate::evaluator::{
        EvalMetric, EvaluateResult, Evaluator, FinalResponseMatch, PerInvocationResult, Registry,
        ToolTrajectoryMatch,
    };
    pub use crate::runtime::{AgentEvent, AgentRuntime, EventStream, ReplayRuntime, RunOption, RunOptions};
    pub use crate::service::{
        Callbacks, EvalCallback, EvalCaseResult, EvalMetricResult, EvalMetricResultPerInvocation,
        EvalOption, EvaluateConfig, EvaluateRequest, InferenceRequest, InferenceResult,
        LocalEvalService, Options, ServiceStats, with_callbacks, with_case_parallelism,
        with_case_source, with_case_timeout, with_nonblocking_submit, with_parallel_evaluation,
        with_parallel_inference, with_registry, with_run_options, with_session_id_supplier,
    };
    pub use crate::status::EvalStatus;
}
