//! # Logging
//!
//! One-shot `tracing-subscriber` initialization shared by both binaries.
//! Honors `RUST_LOG` when set; otherwise defaults to `info`, or `debug` for
//! the whole crate when `--debug` is passed.

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. Must be called once, as early
/// as possible in `main`, before any other `tracing` call.
pub fn init(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}
