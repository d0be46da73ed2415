//! Event bus error types.

use thiserror::Error;

/// Errors raised by handlers and the bus.
#[derive(Debug, Error)]
pub enum EventError {
    /// A handler failed while processing an event.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The payload is missing a required field or has the wrong shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The router has been dropped; emitted through a stale
    /// [`EventEmitter`](crate::EventEmitter).
    #[error("event bus is closed")]
    BusClosed,

    /// An invalid glob pattern was supplied to `subscribe`.
    #[error("invalid pattern {pattern}: {message}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Parser diagnostics.
        message: String,
    },
}

/// Result type for bus operations.
pub type EventResult<T> = Result<T, EventError>;

/// What a handler invocation produces: a response value, nothing, or an
/// error. `None` means "not mine" — dispatch continues to the next handler.
pub type HandlerOutput = EventResult<Option<serde_json::Value>>;
