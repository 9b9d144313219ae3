use std::path::PathBuf;

use tempfile::TempDir;

/// A unique socket path inside a per-test temporary directory. The
/// directory guard must stay alive for the duration of the test.
pub fn socket_path(name: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    (dir, path)
}

/// Opt-in diagnostics via `RUST_LOG`.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
