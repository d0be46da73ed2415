//! Configuration types.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Unix socket path. Defaults to `<ksi_home>/daemon.sock`.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Base log level (`trace`..`error`).
    pub log_level: String,
    /// Log format: `pretty`, `compact`, or `json`.
    pub log_format: String,
    /// State directory override (holds `db/async_state.db`).
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Response log directory override.
    #[serde(default)]
    pub response_log_dir: Option<PathBuf>,
    /// Sandbox root override.
    #[serde(default)]
    pub sandbox_dir: Option<PathBuf>,
    /// Log directory override.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Event bus settings.
    pub bus: BusConfig,
    /// Completion service settings.
    pub completion: CompletionConfig,
    /// Daemon lifecycle settings.
    pub daemon: DaemonConfig,
}

/// Event bus settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Bounded event-history length.
    pub max_history: usize,
    /// Default correlation timeout in seconds.
    pub correlation_timeout_secs: u64,
}

/// Completion service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionConfig {
    /// Provider executable invoked for completions.
    pub provider_command: String,
    /// Model used when a request does not name one.
    pub default_model: String,
    /// Seconds an empty, idle conversation queue survives before GC.
    pub queue_gc_ttl_secs: u64,
}

/// Daemon lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Grace period for in-flight work during shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Config {
    /// Validate semantic constraints on the merged configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero timeouts, an empty
    /// socket path, or an unknown log format.
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(path) = &self.socket_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("socket_path is empty".into()));
            }
        }
        if self.bus.max_history == 0 {
            return Err(ConfigError::Invalid("bus.max_history must be > 0".into()));
        }
        if self.bus.correlation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "bus.correlation_timeout_secs must be > 0".into(),
            ));
        }
        if !matches!(self.log_format.as_str(), "pretty" | "compact" | "json") {
            return Err(ConfigError::Invalid(format!(
                "unknown log_format: {}",
                self.log_format
            )));
        }
        Ok(())
    }

    /// Socket path, falling back to the home default.
    #[must_use]
    pub fn resolve_socket_path(&self, home: &ksi_core::KsiHome) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| home.socket_path())
    }

    /// State directory, falling back to the home default.
    #[must_use]
    pub fn resolve_state_dir(&self, home: &ksi_core::KsiHome) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| home.db_dir())
    }

    /// Response log directory, falling back to the home default.
    #[must_use]
    pub fn resolve_response_log_dir(&self, home: &ksi_core::KsiHome) -> PathBuf {
        self.response_log_dir
            .clone()
            .unwrap_or_else(|| home.responses_dir())
    }

    /// Sandbox root, falling back to the home default.
    #[must_use]
    pub fn resolve_sandbox_dir(&self, home: &ksi_core::KsiHome) -> PathBuf {
        self.sandbox_dir
            .clone()
            .unwrap_or_else(|| home.sandbox_dir())
    }

    /// Log directory, falling back to the home default.
    #[must_use]
    pub fn resolve_log_dir(&self, home: &ksi_core::KsiHome) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| home.logs_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        toml::from_str(include_str!("defaults.toml")).unwrap()
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_format() {
        let mut config = base_config();
        config.log_format = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_falls_back_to_home() {
        let home = ksi_core::KsiHome::from_path("/tmp/ksi-home");
        let config = base_config();
        assert_eq!(
            config.resolve_socket_path(&home),
            PathBuf::from("/tmp/ksi-home/daemon.sock")
        );
        assert_eq!(
            config.resolve_response_log_dir(&home),
            PathBuf::from("/tmp/ksi-home/responses")
        );
    }

    #[test]
    fn test_resolve_honours_override() {
        let home = ksi_core::KsiHome::from_path("/tmp/ksi-home");
        let mut config = base_config();
        config.socket_path = Some("/run/ksi.sock".into());
        assert_eq!(
            config.resolve_socket_path(&home),
            PathBuf::from("/run/ksi.sock")
        );
    }
}
