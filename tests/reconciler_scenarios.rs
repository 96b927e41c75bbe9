//! Integration-level coverage of the end-to-end scenarios in §8 of the
//! design document, exercised against the public `gitfleet` API rather than
//! internals. Scenarios that require a live `git`/`mount`/`systemctl` are
//! approximated by driving `ReconcilerState` and `decide` directly, since
//! those are the boundary the Reconciler's tick loop is built on.

use chrono::Utc;
use gitfleet::config::Config;
use gitfleet::reconciler::{decide, Decision, ReconcilerState, State};

const CONFIG: &str = r#"
[global]
upstream = "https://example.com/gitfleet-config"
mount = "/var/lib/gitfleet"

[[services]]
machine = "h1"
service = "grafana"
branch = "main"
action = "restart"
dirs = [{ local = "/etc/grafana", link = "grafana/etc" }]
"#;

#[test]
fn config_parses_one_service_matching_host() {
    let cfg = Config::parse(CONFIG).expect("config should parse");
    assert_eq!(cfg.services.len(), 1);
    let svc = &cfg.services[0];
    assert_eq!(svc.machine, "h1");
    assert_eq!(svc.service, "grafana");
    assert_eq!(svc.action, "restart");
    assert_eq!(svc.dirs[0].local, "/etc/grafana");
    assert_eq!(svc.dirs[0].link, "grafana/etc");
}

#[tokio::test]
async fn fresh_start_begins_ok_with_empty_hash_and_info() {
    // Scenario 1: fresh start, no changes — the state a Supervisor leaves a
    // service in before its first pull ever runs.
    let state = ReconcilerState::new("grafana", Utc::now());
    let snap = state.snapshot().await;
    assert_eq!(snap.state, State::Ok);
    assert_eq!(snap.hash, "");
    assert_eq!(snap.info, "");
}

#[tokio::test]
async fn freeze_then_upstream_change_stays_frozen() {
    // Scenario 4: freezing a service makes subsequent ticks idle regardless
    // of what upstream does, until explicitly unfrozen.
    let state = ReconcilerState::new("grafana", Utc::now());
    state.set_hash("deadbeef").await;
    state.set_frozen("").await;

    let snap = state.snapshot().await;
    assert_eq!(decide(snap.state, &snap.info, &snap.hash), Decision::Idle);
    assert_eq!(snap.hash, "deadbeef", "a frozen tick must not touch the hash");
}

#[tokio::test]
async fn rollback_to_specific_hash_then_converges_to_frozen() {
    // Scenario 5: rollback is requested, the next tick drives the actual
    // checkout, and a successful rollback always lands on FROZEN with the
    // target hash recorded in `info`.
    let state = ReconcilerState::new("grafana", Utc::now());
    state.set_hash("11112222").await;
    state.set_rollback("abcd1234").await;

    let snap = state.snapshot().await;
    assert_eq!(
        decide(snap.state, &snap.info, &snap.hash),
        Decision::Rollback { target: "abcd1234".to_string() }
    );

    // Simulate the Reconciler completing the rollback side effects.
    state.set_hash("abcd1234").await;
    state.set_frozen("ROLLBACK: abcd1234").await;

    let after = state.snapshot().await;
    assert_eq!(after.state, State::Frozen);
    assert_eq!(after.info, "ROLLBACK: abcd1234");
    assert_eq!(after.hash, "abcd1234");
    // Once hash matches the rollback target, a fresh `set(ROLLBACK, ...)`
    // at that same target would now be idle rather than re-invoking git.
    assert_eq!(decide(State::Rollback, "abcd1234", "abcd1234"), Decision::Idle);
}

#[tokio::test]
async fn broken_recovers_to_ok_on_next_successful_pull() {
    // Scenario 6: BROKEN is not sticky — a tick in BROKEN still attempts a
    // pull, and a successful one returns the service to OK.
    let state = ReconcilerState::new("grafana", Utc::now());
    state.set_broken("upstream unreachable").await;

    let snap = state.snapshot().await;
    assert_eq!(decide(snap.state, &snap.info, &snap.hash), Decision::Pull);

    state.set_hash("cafef00d").await;
    state.set_ok("").await;

    let after = state.snapshot().await;
    assert_eq!(after.state, State::Ok);
    assert_eq!(after.info, "");
    assert_eq!(after.hash, "cafef00d");
}

#[tokio::test]
async fn unfreeze_resumes_pulling() {
    let state = ReconcilerState::new("grafana", Utc::now());
    state.set_frozen("").await;
    state.set_ok("").await;

    let snap = state.snapshot().await;
    assert_eq!(decide(snap.state, &snap.info, &snap.hash), Decision::Pull);
}
