//! State service error types.

use thiserror::Error;

/// Errors raised by the state stores.
#[derive(Debug, Error)]
pub enum StateError {
    /// SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A referenced entity does not exist.
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// Filesystem failure while opening the database.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;
