//! Error types for evalkit operations

/// Result type for evalkit operations
pub type Result<T> = std::result::Result<T, EvalError>;

/// Error types for the evaluation engine
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// Service or call options are unusable
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Batch request is malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A registered callback returned an error
    #[error("{0}")]
    Callback(String),

    /// An eval case cannot be processed as recorded
    #[error("{0}")]
    CaseValidation(String),

    /// The agent runtime failed or produced an unusable event stream
    #[error("{0}")]
    Runtime(String),

    /// The worker pool refused a task
    #[error("task rejected: {0}")]
    Rejected(String),

    /// A named resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The execution context was cancelled
    #[error("context cancelled")]
    Cancelled,

    /// The execution context deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Per-case processing panicked
    #[error("case processing panicked: {0}")]
    Panicked(String),

    /// Wrapped error with identifying context
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<EvalError>,
    },

    /// Several errors reported together
    #[error("{}", join_messages(.0))]
    Joined(Vec<EvalError>),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

fn join_messages(errors: &[EvalError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl EvalError {
    /// Wrap this error with a context prefix
    pub fn context(self, context: impl Into<String>) -> Self {
        EvalError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Join an optional earlier error with a later one.
    ///
    /// Returns the later error alone when there is nothing to join.
    pub fn join(first: Option<EvalError>, second: EvalError) -> Self {
        match first {
            Some(first) => EvalError::Joined(vec![first, second]),
            None => second,
        }
    }

    /// Whether this error (or the error it wraps) came from cancellation or a deadline
    pub fn is_cancellation(&self) -> bool {
        match self {
            EvalError::Cancelled | EvalError::DeadlineExceeded => true,
            EvalError::Context { source, .. } => source.is_cancellation(),
            EvalError::Joined(errors) => errors.iter().any(EvalError::is_cancellation),
            _ => false,
        }
    }
}

impl From<String> for EvalError {
    fn from(s: String) -> Self {
        EvalError::Other(s)
    }
}

impl From<&str> for EvalError {
    fn from(s: &str) -> Self {
        EvalError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for EvalError {
    fn from(err: anyhow::Error) -> Self {
        EvalError::Other(err.to_string())
    }
}
