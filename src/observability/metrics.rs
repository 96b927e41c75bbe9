//! # Metrics
//!
//! Prometheus metrics published by the agent.
//!
//! ## Metrics exposed
//!
//! - `gitfleet_service_state{service}` — current reconciler state, packed as 0=OK, 1=FROZEN, 2=ROLLBACK, 3=BROKEN
//! - `gitfleet_service_change_timestamp{service}` — unix timestamp of the last state/info write
//! - `gitfleet_service_hash{service}` — first 8 hex characters of HEAD, packed as a numeric gauge
//! - `gitfleet_git_ops_total{service}` — count of `git` invocations
//! - `gitfleet_git_error_total{service}` — count of failed `git` invocations

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::LazyLock;

use crate::constants::METRICS_NAMESPACE;
use crate::reconciler::{State, StateSnapshot};

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(METRICS_NAMESPACE)
}

static SERVICE_STATE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        opts("service_state", "Current reconciler state (0=OK, 1=FROZEN, 2=ROLLBACK, 3=BROKEN)"),
        &["service"],
    )
    .expect("failed to create gitfleet_service_state metric - this should never happen")
});

static SERVICE_CHANGE_TIMESTAMP: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        opts("service_change_timestamp", "Unix timestamp of the last state/info write for this service"),
        &["service"],
    )
    .expect("failed to create gitfleet_service_change_timestamp metric - this should never happen")
});

static SERVICE_HASH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        opts("service_hash", "First 8 hex characters of the worktree HEAD, packed as a 32-bit integer"),
        &["service"],
    )
    .expect("failed to create gitfleet_service_hash metric - this should never happen")
});

static GIT_OPS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(opts("git_ops_total", "Total number of git invocations"), &["service"])
        .expect("failed to create gitfleet_git_ops_total metric - this should never happen")
});

static GIT_ERROR_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(opts("git_error_total", "Total number of failed git invocations"), &["service"])
        .expect("failed to create gitfleet_git_error_total metric - this should never happen")
});

/// Registers every metric into the process-wide registry. Must be called once at startup
/// before the HTTP server starts serving `/metrics`.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(SERVICE_STATE.clone()))?;
    REGISTRY.register(Box::new(SERVICE_CHANGE_TIMESTAMP.clone()))?;
    REGISTRY.register(Box::new(SERVICE_HASH.clone()))?;
    REGISTRY.register(Box::new(GIT_OPS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GIT_ERROR_TOTAL.clone()))?;
    Ok(())
}

pub(crate) fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

/// Packs up to 8 hex characters into an i64 by parsing them as a base-16 integer.
/// An empty hash packs to 0.
fn pack_hash(hash: &str) -> i64 {
    if hash.is_empty() {
        return 0;
    }
    i64::from_str_radix(hash, 16).unwrap_or(0)
}

fn state_ordinal(state: State) -> i64 {
    match state {
        State::Ok => 0,
        State::Frozen => 1,
        State::Rollback => 2,
        State::Broken => 3,
    }
}

/// Publishes the full set of per-service gauges from a freshly-read snapshot. Called by
/// `ReconcilerState`'s write path so that metrics and state can never drift apart.
pub fn publish_service_state(service: &str, snapshot: &StateSnapshot) {
    SERVICE_STATE
        .with_label_values(&[service])
        .set(state_ordinal(snapshot.state));
    SERVICE_CHANGE_TIMESTAMP
        .with_label_values(&[service])
        .set(snapshot.change_time.timestamp());
    SERVICE_HASH
        .with_label_values(&[service])
        .set(pack_hash(&snapshot.hash));
}

pub fn increment_git_ops(service: &str) {
    GIT_OPS_TOTAL.with_label_values(&[service]).inc();
}

pub fn increment_git_errors(service: &str) {
    GIT_ERROR_TOTAL.with_label_values(&[service]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_hash_empty_is_zero() {
        assert_eq!(pack_hash(""), 0);
    }

    #[test]
    fn pack_hash_round_trips_hex() {
        assert_eq!(pack_hash("abcd1234"), 0xabcd1234);
    }

    #[test]
    fn increment_git_ops_bumps_counter() {
        let before = GIT_OPS_TOTAL.with_label_values(&["grafana"]).get();
        increment_git_ops("grafana");
        let after = GIT_OPS_TOTAL.with_label_values(&["grafana"]).get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn increment_git_errors_bumps_counter() {
        let before = GIT_ERROR_TOTAL.with_label_values(&["grafana"]).get();
        increment_git_errors("grafana");
        let after = GIT_ERROR_TOTAL.with_label_values(&["grafana"]).get();
        assert_eq!(after, before + 1);
    }
}
