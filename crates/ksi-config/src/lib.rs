//! KSI Config - Layered configuration for the KSI daemon.
//!
//! Implements the `load()` algorithm:
//! 1. Parse embedded `defaults.toml` → base
//! 2. Merge `<ksi_home>/config.toml` (user overlay)
//! 3. Apply `KSI_*` environment overrides
//! 4. Deserialize merged tree → [`Config`]
//! 5. Validate
//!
//! Directory fields default to the [`KsiHome`](ksi_core::KsiHome) layout
//! when unset; use the `resolve_*` accessors rather than reading the raw
//! option fields.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod types;

pub use error::{ConfigError, ConfigResult};
pub use types::{BusConfig, CompletionConfig, Config, DaemonConfig};

use std::path::Path;

use tracing::{debug, info};

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Load the configuration with layered precedence.
///
/// `home` is the resolved KSI home directory; its `config.toml` (if
/// present) overlays the embedded defaults, and `KSI_*` environment
/// variables overlay both.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a config file is malformed or the merged
/// configuration fails validation.
pub fn load(home: &ksi_core::KsiHome) -> ConfigResult<Config> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::Parse {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let user_path = home.config_path();
    if let Some(overlay) = try_load_file(&user_path)? {
        deep_merge(&mut merged, &overlay);
        info!(path = %user_path.display(), "loaded user config");
    }

    let mut config: Config = merged
        .try_into()
        .map_err(|e| ConfigError::Deserialize(e.to_string()))?;

    apply_env_overrides(&mut config);
    config.validate()?;
    debug!(?config, "configuration resolved");
    Ok(config)
}

fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    let value = toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(Some(value))
}

/// Recursively merge `overlay` into `base`. Tables merge key-by-key;
/// everything else replaces.
fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_table.insert(key.clone(), value.clone());
                    },
                }
            }
        },
        (base_slot, _) => *base_slot = overlay.clone(),
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(socket) = std::env::var("KSI_DAEMON_SOCKET") {
        config.socket_path = Some(socket.into());
    }
    if let Ok(level) = std::env::var("KSI_LOG_LEVEL") {
        config.log_level = level;
    }
    if let Ok(format) = std::env::var("KSI_LOG_FORMAT") {
        config.log_format = format;
    }
    if let Ok(dir) = std::env::var("KSI_STATE_DIR") {
        config.state_dir = Some(dir.into());
    }
    if let Ok(dir) = std::env::var("KSI_RESPONSE_LOG_DIR") {
        config.response_log_dir = Some(dir.into());
    }
    if let Ok(dir) = std::env::var("KSI_SANDBOX_DIR") {
        config.sandbox_dir = Some(dir.into());
    }
    if let Ok(dir) = std::env::var("KSI_LOG_DIR") {
        config.log_dir = Some(dir.into());
    }
}
