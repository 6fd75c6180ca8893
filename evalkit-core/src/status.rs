//! Case and metric status values

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of processing or scoring one eval case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    /// Nothing was evaluated yet
    #[default]
    NotEvaluated,
    /// Processing or scoring succeeded
    Passed,
    /// Processing or scoring failed
    Failed,
}

impl EvalStatus {
    /// Status for a score compared against a threshold
    pub fn for_score(score: f64, threshold: f64) -> Self {
        if score >= threshold {
            EvalStatus::Passed
        } else {
            EvalStatus::Failed
        }
    }

    /// Fold several statuses: any failure fails, any pass passes, otherwise not evaluated
    pub fn aggregate(statuses: impl IntoIterator<Item = EvalStatus>) -> Self {
        let mut overall = EvalStatus::NotEvaluated;
        for status in statuses {
            match status {
                EvalStatus::Failed => return EvalStatus::Failed,
                EvalStatus::Passed => overall = EvalStatus::Passed,
                EvalStatus::NotEvaluated => {}
            }
        }
        overall
    }
}

impl fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalStatus::NotEvaluated => write!(f, "not_evaluated"),
            EvalStatus::Passed => write!(f, "passed"),
            EvalStatus::Failed => write!(f, "failed"),
        }
    }
}
