//! Structured logging setup.
//!
//! Filtering comes from `RUST_LOG`, defaulting to `info`. Logs go to stderr
//! so command output on stdout stays machine-readable.

use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init() {
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
