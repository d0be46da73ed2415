//! Registry error types.

use thiserror::Error;

/// Errors raised by the plugin registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No plugin with that name is loaded.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// A plugin with that name is already loaded.
    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    /// The plugin declares itself non-reloadable and `force` was not set.
    #[error("plugin is not reloadable: {0}")]
    NotReloadable(String),

    /// The plugin was loaded without a factory, so it cannot be
    /// re-instantiated.
    #[error("plugin has no factory registered: {0}")]
    NoFactory(String),

    /// The plugin's startup hook failed.
    #[error("plugin {plugin} failed to start: {message}")]
    Startup {
        /// Plugin name.
        plugin: String,
        /// Failure description.
        message: String,
    },
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
