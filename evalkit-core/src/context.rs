//! Execution context threaded through every engine call
//!
//! An [`EvalContext`] carries a cancellation token, an optional deadline and an
//! immutable key/value map. Deriving a context never mutates the parent, so a
//! value set by a before-case callback is only visible to work for that case.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::EvalError;

/// Cancellable, deadline-aware execution context
#[derive(Debug, Clone)]
pub struct EvalContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    values: Arc<HashMap<String, Value>>,
}

impl Default for EvalContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalContext {
    /// Create a root context that is never cancelled on its own
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: None,
            values: Arc::new(HashMap::new()),
        }
    }

    /// Create a root context driven by an existing token
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: token,
            ..Self::new()
        }
    }

    /// Derive a context whose token is cancelled together with this one
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            deadline: self.deadline,
            values: self.values.clone(),
        }
    }

    /// Derive a context carrying an additional value
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.into(), value.into());
        Self {
            cancellation: self.cancellation.clone(),
            deadline: self.deadline,
            values: Arc::new(values),
        }
    }

    /// Derive a context whose deadline is at most `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with the earlier of the current and the given deadline
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            cancellation: self.cancellation.clone(),
            deadline: Some(deadline),
            values: self.values.clone(),
        }
    }

    /// Look up a value
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Look up a string value
    pub fn value_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token backing this context
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Cancel this context and every context derived from it with `child`
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The reason this context is done, if it is
    pub fn err(&self) -> Option<EvalError> {
        if self.cancellation.is_cancelled() {
            return Some(EvalError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(EvalError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context is cancelled or its deadline passes
    pub async fn done(&self) -> EvalError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancellation.cancelled() => EvalError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => EvalError::DeadlineExceeded,
            },
            None => {
                self.cancellation.cancelled().await;
                EvalError::Cancelled
            }
        }
    }
}
