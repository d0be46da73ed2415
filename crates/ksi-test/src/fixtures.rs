//! Filesystem fixtures.

use ksi_core::KsiHome;
use tempfile::TempDir;

/// An isolated KSI home in a temp directory, scaffolded and ready.
///
/// Keep the [`TempDir`] alive for the duration of the test.
///
/// # Panics
///
/// Panics if the temp directory cannot be created.
#[must_use]
pub fn temp_home() -> (TempDir, KsiHome) {
    let dir = TempDir::new().expect("create temp dir");
    let home = KsiHome::from_path(dir.path());
    home.ensure().expect("scaffold ksi home");
    (dir, home)
}
