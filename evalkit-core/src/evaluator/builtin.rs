//! Built-in evaluators
//!
//! Both compare invocation pairs position by position and average the scores.

use async_trait::async_trait;

use super::{EvalMetric, EvaluateResult, Evaluator, PerInvocationResult};
use crate::context::EvalContext;
use crate::error::{EvalError, Result};
use crate::evalset::Invocation;
use crate::status::EvalStatus;

fn check_lengths(actuals: &[Invocation], expecteds: &[Invocation]) -> Result<()> {
    if actuals.len() != expecteds.len() {
        return Err(EvalError::CaseValidation(format!(
            "actual invocations ({}) and expected invocations ({}) count mismatch",
            actuals.len(),
            expecteds.len()
        )));
    }
    Ok(())
}

fn score_pairs(
    actuals: &[Invocation],
    expecteds: &[Invocation],
    metric: &EvalMetric,
    score_one: impl Fn(&Invocation, &Invocation) -> (f64, String),
) -> EvaluateResult {
    let per_invocation = actuals
        .iter()
        .zip(expecteds)
        .map(|(actual, expected)| {
            let (score, reason) = score_one(actual, expected);
            PerInvocationResult {
                actual_invocation: actual.clone(),
                expected_invocation: Some(expected.clone()),
                score: Some(score),
                status: EvalStatus::for_score(score, metric.threshold),
                reason: Some(reason),
            }
        })
        .collect();
    EvaluateResult::from_per_invocation(per_invocation, metric.threshold)
}

/// Exact match of the trimmed final response text
pub struct FinalResponseMatch;

#[async_trait]
impl Evaluator for FinalResponseMatch {
    fn name(&self) -> &str {
        "final_response_match"
    }

    fn description(&self) -> &str {
        "Final response text equals the expected final response"
    }

    async fn evaluate(
        &self,
        _ctx: &EvalContext,
        actuals: &[Invocation],
        expecteds: &[Invocation],
        metric: &EvalMetric,
    ) -> Result<EvaluateResult> {
        check_lengths(actuals, expecteds)?;
        Ok(score_pairs(actuals, expecteds, metric, |actual, expected| {
            match (actual.final_text(), expected.final_text()) {
                (Some(a), Some(e)) if a.trim() == e.trim() => (1.0, "match".to_string()),
                (Some(_), Some(_)) => (0.0, "final response differs".to_string()),
                (None, _) => (0.0, "missing final response".to_string()),
                (Some(_), None) => (0.0, "no expected final response".to_string()),
            }
        }))
    }
}

/// Same tool names and arguments, in the same order
pub struct ToolTrajectoryMatch;

#[async_trait]
impl Evaluator for ToolTrajectoryMatch {
    fn name(&self) -> &str {
        "tool_trajectory_match"
    }

    fn description(&self) -> &str {
        "Tool calls match the expected tool names and arguments in order"
    }

    async fn evaluate(
        &self,
        _ctx: &EvalContext,
        actuals: &[Invocation],
        expecteds: &[Invocation],
        metric: &EvalMetric,
    ) -> Result<EvaluateResult> {
        check_lengths(actuals, expecteds)?;
        Ok(score_pairs(actuals, expecteds, metric, |actual, expected| {
            if actual.tool_uses.len() != expected.tool_uses.len() {
                return (
                    0.0,
                    format!(
                        "expected {} tool calls, got {}",
                        expected.tool_uses.len(),
                        actual.tool_uses.len()
                    ),
                );
            }
            let mismatch = actual
                .tool_uses
                .iter()
                .zip(&expected.tool_uses)
                .position(|(a, e)| a.name != e.name || a.args != e.args);
            match mismatch {
                None => (1.0, "trajectory matched".to_string()),
                Some(idx) => (0.0, format!("tool call {} differs", idx)),
            }
        }))
    }
}
