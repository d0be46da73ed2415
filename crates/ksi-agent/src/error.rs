//! Agent service error types.

use thiserror::Error;

/// Errors raised by the agent service.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The referenced agent does not exist.
    #[error("agent not found: {0}")]
    NotFound(String),

    /// Composition resolution failed.
    #[error("composition error: {0}")]
    Composition(String),

    /// Sandbox directory could not be created.
    #[error("sandbox error: {0}")]
    Sandbox(#[from] std::io::Error),

    /// The event bus is gone (daemon shutting down).
    #[error("event bus unavailable")]
    BusUnavailable,
}

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;
