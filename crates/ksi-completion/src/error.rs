//! Completion service error types.

use thiserror::Error;

/// Errors raised by the completion service and providers.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// The provider executable was not found on `PATH`. Fatal for the
    /// request, not for the service.
    #[error("provider executable not found: {0}")]
    ExecutableNotFound(String),

    /// The provider exited non-zero or produced an unusable response.
    #[error("provider failed: {message}")]
    Provider {
        /// Failure description.
        message: String,
        /// Captured stderr, when available.
        stderr: Option<String>,
    },

    /// Provider output could not be parsed.
    #[error("malformed provider output: {0}")]
    MalformedOutput(String),

    /// The request payload is invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Filesystem failure (response logs, sandbox).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Async-state persistence failure (injection queues).
    #[error("state error: {0}")]
    State(#[from] ksi_state::StateError),

    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,
}

/// Result type for completion operations.
pub type CompletionResult<T> = Result<T, CompletionError>;
