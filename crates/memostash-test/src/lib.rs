//! Helpers for testing the memoization engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the store root is deleted while the
//!    test is still using it. To avoid this, assign it to a variable in the test function
//!    (e.g. `let root = memostash_test::tempdir()`).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memostash` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memostash=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `contents` to the file `name` in `dir`, returning its path.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Moves the modification time of `path` by `offset` into the future.
///
/// File systems with a coarse timestamp resolution would otherwise not notice quick successive
/// writes.
///
/// # Panics
///
/// Panics if the file does not exist.
pub fn touch(path: &Path, offset: Duration) {
    let modified = std::fs::metadata(path).unwrap().modified().unwrap();
    filetime::set_file_mtime(path, FileTime::from_system_time(modified + offset)).unwrap();
}

/// Sets the modification time of `path` to `time`.
///
/// # Panics
///
/// Panics if the file does not exist.
pub fn set_modified(path: &Path, time: SystemTime) {
    filetime::set_file_mtime(path, FileTime::from_system_time(time)).unwrap();
}
