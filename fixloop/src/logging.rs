//! Tracing setup for the fixloop CLI.
//!
//! - **Tracing (this module)**: progress and diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted.
//! - **Iteration logging (`io/iteration_log`)**: on-disk artifacts under `--log-dir`,
//!   unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` so loop progress is visible.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=fixloop=debug fixloop repair "make test"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
