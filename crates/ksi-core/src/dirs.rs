//! Directory scaffolding for the KSI home directory.
//!
//! All daemon state lives under a single root, `~/.ksi/` by default
//! (overridable via `$KSI_HOME`):
//!
//! ```text
//! ~/.ksi/                        (KsiHome)
//! ├── daemon.sock                  (Unix socket, default path)
//! ├── db/
//! │   └── async_state.db           (SQLite — injections, observation history)
//! ├── responses/
//! │   └── <session_id>.jsonl       (one line per completion turn)
//! ├── sandbox/
//! │   └── <sandbox_uuid>/          (per-agent working directory)
//! ├── logs/
//! │   └── daemon.log               (structured logs)
//! └── config.toml                  (optional config overlay)
//! ```

use std::io;
use std::path::{Path, PathBuf};

/// The KSI home directory (`~/.ksi/` or `$KSI_HOME`).
#[derive(Debug, Clone)]
pub struct KsiHome {
    root: PathBuf,
}

impl KsiHome {
    /// Resolve the home directory.
    ///
    /// Checks `$KSI_HOME` first, then falls back to `$HOME/.ksi/`.
    ///
    /// # Errors
    ///
    /// Returns an error if `$KSI_HOME` is relative, or if neither
    /// `$KSI_HOME` nor `$HOME` is set.
    pub fn resolve() -> io::Result<Self> {
        let root = if let Ok(custom) = std::env::var("KSI_HOME") {
            let p = PathBuf::from(&custom);
            if !p.is_absolute() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "KSI_HOME must be an absolute path",
                ));
            }
            p
        } else {
            let home = std::env::var("HOME").map_err(|_| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    "neither KSI_HOME nor HOME environment variable is set",
                )
            })?;
            PathBuf::from(home).join(".ksi")
        };

        Ok(Self { root })
    }

    /// Create from an explicit path (useful for testing).
    #[must_use]
    pub fn from_path(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Ensure the directory structure exists with secure permissions.
    ///
    /// Creates `db/`, `responses/`, `sandbox/`, and `logs/` and sets the
    /// tree to `0o700` on Unix (owner-only access).
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation or permission setting fails.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.db_dir())?;
        std::fs::create_dir_all(self.responses_dir())?;
        std::fs::create_dir_all(self.sandbox_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(self.root(), perms.clone())?;
            std::fs::set_permissions(self.db_dir(), perms.clone())?;
            std::fs::set_permissions(self.responses_dir(), perms.clone())?;
            std::fs::set_permissions(self.sandbox_dir(), perms.clone())?;
            std::fs::set_permissions(self.logs_dir(), perms)?;
        }
        Ok(())
    }

    /// Root directory path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Default Unix socket path (`~/.ksi/daemon.sock`).
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    /// Database directory (`~/.ksi/db/`).
    #[must_use]
    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    /// Path to the async-state SQLite database.
    #[must_use]
    pub fn async_state_db_path(&self) -> PathBuf {
        self.db_dir().join("async_state.db")
    }

    /// Completion response logs directory (`~/.ksi/responses/`).
    #[must_use]
    pub fn responses_dir(&self) -> PathBuf {
        self.root.join("responses")
    }

    /// Agent sandbox root (`~/.ksi/sandbox/`).
    #[must_use]
    pub fn sandbox_dir(&self) -> PathBuf {
        self.root.join("sandbox")
    }

    /// Logs directory (`~/.ksi/logs/`).
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Path to the daemon log file.
    #[must_use]
    pub fn daemon_log_path(&self) -> PathBuf {
        self.logs_dir().join("daemon.log")
    }

    /// Path to the optional configuration overlay.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate the `KSI_HOME` env var.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_resolve_with_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        // SAFETY: serialized by ENV_MUTEX
        unsafe { std::env::set_var("KSI_HOME", &path) };
        let home = KsiHome::resolve().unwrap();
        assert_eq!(home.root(), path);
        unsafe { std::env::remove_var("KSI_HOME") };
    }

    #[test]
    fn test_resolve_default() {
        let _guard = ENV_MUTEX.lock().unwrap();
        // SAFETY: serialized by ENV_MUTEX
        unsafe { std::env::remove_var("KSI_HOME") };
        let home = KsiHome::resolve().unwrap();
        let expected = PathBuf::from(std::env::var("HOME").unwrap()).join(".ksi");
        assert_eq!(home.root(), expected);
    }

    #[test]
    fn test_rejects_relative_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        // SAFETY: serialized by ENV_MUTEX
        unsafe { std::env::set_var("KSI_HOME", "relative/path") };
        assert!(KsiHome::resolve().is_err());
        unsafe { std::env::remove_var("KSI_HOME") };
    }

    #[test]
    fn test_ensure_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let home = KsiHome::from_path(dir.path());
        home.ensure().unwrap();

        assert!(home.db_dir().exists());
        assert!(home.responses_dir().exists());
        assert!(home.sandbox_dir().exists());
        assert!(home.logs_dir().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let home = KsiHome::from_path(dir.path());
        home.ensure().unwrap();

        let perms = std::fs::metadata(home.root()).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o700);
    }

    #[test]
    fn test_path_accessors() {
        let home = KsiHome::from_path("/tmp/test-ksi");
        assert_eq!(home.socket_path(), PathBuf::from("/tmp/test-ksi/daemon.sock"));
        assert_eq!(
            home.async_state_db_path(),
            PathBuf::from("/tmp/test-ksi/db/async_state.db")
        );
        assert_eq!(
            home.daemon_log_path(),
            PathBuf::from("/tmp/test-ksi/logs/daemon.log")
        );
        assert_eq!(home.config_path(), PathBuf::from("/tmp/test-ksi/config.toml"));
    }
}
