//! Observation service error types.

use thiserror::Error;

/// Errors raised by the observation service.
#[derive(Debug, Error)]
pub enum ObservationError {
    /// An event or filter pattern did not compile.
    #[error("invalid pattern {pattern}: {message}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Parser diagnostics.
        message: String,
    },

    /// History persistence failed.
    #[error("state error: {0}")]
    State(#[from] ksi_state::StateError),

    /// The referenced subscription does not exist.
    #[error("subscription not found: {0}")]
    NotFound(String),
}

/// Result type for observation operations.
pub type ObservationResult<T> = Result<T, ObservationError>;
