//! # Constants
//!
//! Shared defaults used throughout the agent. Values mirror the CLI defaults
//! documented in the config/flag surface so a bare `gitfleetd --config ...`
//! invocation behaves sensibly.

use std::time::Duration;

/// Default control-channel bind address (`--ssh-addr`).
pub const DEFAULT_SSH_ADDR: &str = ":2222";

/// Default metrics/health bind address (`--metrics-addr`).
pub const DEFAULT_METRICS_ADDR: &str = ":9222";

/// Default poll interval between upstream pulls, before jitter is applied.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// `ConfigWatcher` re-hash interval when `--restart` is enabled. Deliberately
/// shorter than the poll interval so config drift is noticed promptly.
pub const CONFIG_WATCH_INTERVAL: Duration = Duration::from_secs(30);

/// Mode bits used when a Reconciler creates `mount/service` for a fresh checkout.
pub const CHECKOUT_DIR_MODE: u32 = 0o755;

/// Mode bits used when BindMounter creates a missing `dir.local` target.
pub const BIND_TARGET_MODE: u32 = 0o775;

/// Number of hex characters `GitWorktree::hash` truncates `rev-parse HEAD` to.
pub const SHORT_HASH_LEN: usize = 8;

/// Metrics namespace prefix for every `prometheus` metric the agent exports.
pub const METRICS_NAMESPACE: &str = "gitfleet";

/// Exit code signalling "SIGHUP-driven restart, please relaunch me".
pub const EXIT_RESTART: i32 = 2;

/// Exit code for a startup or otherwise fatal error.
pub const EXIT_FATAL: i32 = 1;
