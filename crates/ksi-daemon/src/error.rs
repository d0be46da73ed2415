//! Daemon error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while starting or running the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The Unix socket could not be bound. Fatal at startup.
    #[error("failed to bind socket {path}: {source}")]
    Bind {
        /// Socket path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Filesystem failure (home scaffolding, socket cleanup).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ksi_config::ConfigError),

    /// State store failure.
    #[error(transparent)]
    State(#[from] ksi_state::StateError),

    /// Plugin registry failure.
    #[error(transparent)]
    Registry(#[from] ksi_plugins::RegistryError),
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
