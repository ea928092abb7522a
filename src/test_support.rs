//! Shared helpers for unit tests.

use tracing_subscriber::EnvFilter;

/// Route `tracing` output to the test harness. `RUST_LOG` overrides the
/// default filter; repeated calls are no-ops.
pub(crate) fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jsbridge=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
