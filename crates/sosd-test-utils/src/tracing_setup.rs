//! Tracing helpers for tests.
//!
//! [`init_test_tracing`] routes events to the test-harness writer, once per
//! process. [`capture_logs`] installs a thread-local [`LogCollector`] so a
//! test can assert on what the daemon logged.

use sosd_core::{LogCollector, LogReader};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "sosd_core=debug,info";

/// Initialise a global subscriber that writes to the test-harness writer
/// and respects `RUST_LOG`, defaulting to debug for `sosd_core`.
///
/// Safe to call multiple times; subsequent calls are silently ignored.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_test_writer()
        .try_init();
}

/// Capture events emitted on the current thread into a ring of `capacity`.
///
/// Capture stops when the returned guard drops. Only events from the
/// calling thread are seen, so use a `current_thread` runtime.
///
/// ```ignore
/// let (logs, _guard) = sosd_test_utils::capture_logs(64);
/// tracing::warn!("careful");
/// assert_eq!(logs.len(), 1);
/// ```
pub fn capture_logs(capacity: usize) -> (LogReader, DefaultGuard) {
    let collector = LogCollector::new(capacity);
    let reader = collector.reader();
    let guard = tracing_subscriber::registry().with(collector).set_default();
    (reader, guard)
}
