//! Tracing and logging setup shared by engine binaries and tests.

/// Initialize process-wide logging with the defaults: JSON lines, filter
/// from `RUST_LOG`, `info` otherwise.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogConfig::default());
}

/// Human-readable logs captured by the test harness.
pub fn init_for_tests() {
    tracing::init_for_tests();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use tracing::{LogConfig, LogFormat};
