use tracing_subscriber::EnvFilter;

/// Installs a test-friendly subscriber once per process. `RUST_LOG` applies,
/// default `debug`. Later calls are no-ops.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
