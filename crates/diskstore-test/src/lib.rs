//! Helpers for testing the store and scheduler.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the store keeps writing into a
//!    directory that no longer gets cleaned up. To avoid this, assign it to a variable in the
//!    test function (e.g. `let dir = test::tempdir()`).

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this workspace's crates and mutes
///    all others.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("diskstore-service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up
/// after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}
