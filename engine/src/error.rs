//! Error types for the mailrlm engine.

use thiserror::Error;

/// Errors that can occur during an engine run.
#[derive(Clone, Debug, Error)]
pub enum EngineError {
    /// Missing credential or malformed options. Fatal, exit 2.
    #[error("configuration error: {message}")]
    Configuration {
        /// Error message.
        message: String,
    },

    /// No local backend answered and no remote credential is present. Fatal, exit 4.
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        /// Error message.
        message: String,
    },

    /// Network, 5xx, or timeout failure from a model backend.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether a retry could plausibly succeed.
        retryable: bool,
    },

    /// A session budget limit was hit.
    #[error("budget exceeded: {kind} (limit {limit}, spent {spent})")]
    BudgetExceeded {
        /// Which limit was exceeded.
        kind: BudgetExceededKind,
        /// The configured limit value.
        limit: u64,
        /// The value observed when the limit tripped.
        spent: u64,
    },

    /// Uncaught error from the user program.
    #[error("execution error: {message}")]
    Execution {
        /// Error message.
        message: String,
    },

    /// Malformed email record, bad model name, or similar per-operation failure.
    #[error("validation error: {message}")]
    Validation {
        /// Error message.
        message: String,
    },

    /// Cache IO failure. Treated as a miss by the pipeline.
    #[error("cache error: {message}")]
    Cache {
        /// Error message.
        message: String,
    },

    /// A fan-out item skipped because the session was cancelled before it reserved.
    #[error("cancelled before reservation")]
    Cancelled,
}

/// Budget limits that can be exceeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetExceededKind {
    /// Dollar cost budget.
    Cost,
    /// LLM call count.
    Calls,
    /// Recursion/fan-out depth.
    Depth,
}

impl std::fmt::Display for BudgetExceededKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cost => write!(f, "cost"),
            Self::Calls => write!(f, "calls"),
            Self::Depth => write!(f, "depth"),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Self::Transport {
            message: message.into(),
            retryable,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// The taxonomy kind reported verbatim in the result envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "ConfigurationError",
            Self::BackendUnavailable { .. } => "BackendUnavailable",
            Self::Transport { .. } => "TransportError",
            Self::BudgetExceeded { .. } => "BudgetExceeded",
            Self::Execution { .. } => "ExecutionError",
            Self::Validation { .. } => "ValidationError",
            Self::Cache { .. } => "CacheError",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether a retry at the pipeline layer could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }

    /// Whether this kind terminates the whole run when it reaches the driver.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::BackendUnavailable { .. }
        )
    }

    /// Process exit code for a run that terminated with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. } => 2,
            Self::BudgetExceeded { .. } => 3,
            Self::BackendUnavailable { .. } => 4,
            _ => 1,
        }
    }
}
