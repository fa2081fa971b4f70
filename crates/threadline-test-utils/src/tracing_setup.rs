//! Tracing helpers for tests.
//!
//! [`init_test_tracing`] routes events to the test-harness writer.
//! [`capture_logs`] builds a dispatcher backed by a [`LogCollector`] so a test
//! can inject it into a client and assert on what was logged, without touching
//! global state.

use threadline_core::logging::{LogCollector, LogReader};
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;

/// Initialise a tracing subscriber that writes to the test-harness writer
/// and respects the `RUST_LOG` environment variable.
///
/// Safe to call multiple times — subsequent calls are silently ignored.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// A dispatcher that records every event, plus the handle to read them back.
pub fn capture_logs() -> (Dispatch, LogReader) {
    let collector = LogCollector::new(1024);
    let reader = collector.reader();
    let dispatch = Dispatch::new(tracing_subscriber::registry().with(collector));
    (dispatch, reader)
}
