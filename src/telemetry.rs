//! Opt-in tracing subscriber setup for binaries and examples embedding the
//! poller. Libraries never install a subscriber on their own.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, defaulting to `info`.
pub fn init() {
    init_with_default("info");
}

/// Like [`init`] with a custom fallback filter. Does nothing if a global
/// subscriber is already set.
pub fn init_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
