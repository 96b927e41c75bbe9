//! # Reconciler
//!
//! The per-service state machine. Owns one [`GitWorktree`] and one
//! [`ReconcilerState`], and drives [`BindMounter`] / [`ServiceController`] in
//! response to ticks, pull-now signals, and cancellation.
//!
//! The decision of *what to do next* is a pure function, [`decide`], over
//! `(state, info, hash)` — see §4.4/§9 of the design document. Everything
//! else in this module is the async plumbing that executes the side effects
//! `decide` calls for and publishes the result back into [`ReconcilerState`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::bind_mount::BindMounter;
use crate::config::ServiceSpec;
use crate::git_worktree::GitWorktree;
use crate::observability::metrics;
use crate::service_controller::ServiceController;

/// The four states a service can be in. Ordinal values (used by the
/// `gitfleet_service_state` gauge) are 0=Ok, 1=Frozen, 2=Rollback, 3=Broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Ok,
    Frozen,
    Rollback,
    Broken,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Ok => "OK",
            State::Frozen => "FROZEN",
            State::Rollback => "ROLLBACK",
            State::Broken => "BROKEN",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for State {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// An immutable read of `ReconcilerState` at one point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StateSnapshot {
    pub state: State,
    pub hash: String,
    pub info: String,
    pub change_time: DateTime<Utc>,
}

/// The per-service mutable record from §3. `state`/`info`/`hash` are
/// private; every mutator also republishes the Prometheus gauges so the two
/// can never drift apart (§9).
#[derive(Debug)]
pub struct ReconcilerState {
    service: String,
    inner: RwLock<StateSnapshot>,
}

impl ReconcilerState {
    pub fn new(service: impl Into<String>, change_time: DateTime<Utc>) -> Self {
        let service = service.into();
        let snapshot =
            StateSnapshot { state: State::Ok, hash: String::new(), info: String::new(), change_time };
        metrics::publish_service_state(&service, &snapshot);
        Self { service, inner: RwLock::new(snapshot) }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.inner.read().await.clone()
    }

    async fn write(&self, state: State, info: String) {
        let mut guard = self.inner.write().await;
        guard.state = state;
        guard.info = info;
        guard.change_time = Utc::now();
        metrics::publish_service_state(&self.service, &guard);
    }

    pub async fn set_ok(&self, info: impl Into<String>) {
        self.write(State::Ok, info.into()).await;
    }

    pub async fn set_frozen(&self, info: impl Into<String>) {
        self.write(State::Frozen, info.into()).await;
    }

    pub async fn set_rollback(&self, target: impl Into<String>) {
        self.write(State::Rollback, target.into()).await;
    }

    pub async fn set_broken(&self, info: impl Into<String>) {
        self.write(State::Broken, info.into()).await;
    }

    pub async fn set_hash(&self, hash: impl Into<String>) {
        let mut guard = self.inner.write().await;
        guard.hash = hash.into();
        metrics::publish_service_state(&self.service, &guard);
    }
}

/// What the next tick should do, given the current snapshot. Pure and
/// synchronous so the decision table is unit-testable without spawning a
/// single subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// `state ∈ {FROZEN, ROLLBACK}` and sticky (or already at the rollback
    /// target): no subprocess is invoked this tick.
    Idle,
    /// `state ∈ {OK, BROKEN}`: attempt a pull.
    Pull,
    /// `state == ROLLBACK` and the target differs from the current hash.
    Rollback { target: String },
}

/// The transition table of §4.4, rules 1-3, expressed as one match.
pub fn decide(state: State, info: &str, current_hash: &str) -> Decision {
    match state {
        State::Rollback if info != current_hash => Decision::Rollback { target: info.to_string() },
        State::Frozen | State::Rollback => Decision::Idle,
        State::Ok | State::Broken => Decision::Pull,
    }
}

/// `jittered(d) = d + uniform(0, d/2)`. Returns `d` unchanged for `d == 0`
/// rather than panicking on an empty range.
pub fn jittered(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let half_millis = (base.as_millis() / 2).max(1) as u64;
    let extra = rand::thread_rng().gen_range(0..half_millis);
    base + Duration::from_millis(extra)
}

/// A clonable handle that lets other tasks (the ControlPlane) ask a
/// Reconciler to pull immediately. Single-slot and coalescing: a pull-now
/// request arriving while one is already pending is silently dropped.
#[derive(Debug, Clone)]
pub struct PullNow(mpsc::Sender<()>);

impl PullNow {
    pub fn request(&self) {
        let _ = self.0.try_send(());
    }
}

pub struct Reconciler {
    spec: ServiceSpec,
    state: Arc<ReconcilerState>,
    git: GitWorktree,
    mounter: BindMounter,
    service_ctl: ServiceController,
    poll_interval: Duration,
}

impl Reconciler {
    pub fn new(
        spec: ServiceSpec,
        state: Arc<ReconcilerState>,
        poll_interval: Duration,
    ) -> (Self, PullNow, mpsc::Receiver<()>) {
        let links: Vec<String> = spec.dirs.iter().map(|d| d.link.clone()).collect();
        let git = GitWorktree::new(
            spec.service.clone(),
            spec.upstream.clone(),
            spec.branch.clone(),
            spec.mount.clone(),
            links,
            spec.user.clone(),
        );
        let mounter = BindMounter::new(git.dir(), spec.user.clone());
        let service_ctl = ServiceController::new(spec.service.clone(), spec.action.clone());
        let (tx, rx) = mpsc::channel(1);
        let reconciler = Self { spec, state, git, mounter, service_ctl, poll_interval };
        (reconciler, PullNow(tx), rx)
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn state(&self) -> &Arc<ReconcilerState> {
        &self.state
    }

    pub fn git(&self) -> &GitWorktree {
        &self.git
    }

    pub fn mounter(&self) -> &BindMounter {
        &self.mounter
    }

    pub fn service_controller(&self) -> &ServiceController {
        &self.service_ctl
    }

    /// Drives ticks until `cancel` fires. Suspends on whichever of the
    /// jittered timer, the pull-now channel, or cancellation fires first;
    /// every suspension is followed by at most one `tick`, so transitions
    /// for this service remain totally ordered (§5).
    pub async fn run(&self, mut pull_rx: mpsc::Receiver<()>, cancel: CancellationToken) {
        loop {
            let delay = jittered(self.poll_interval);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
                _ = pull_rx.recv() => {}
            }
            if cancel.is_cancelled() {
                break;
            }
            self.tick().await;
        }
        info!(service = %self.spec.service, "reconciler loop exiting");
    }

    #[instrument(skip(self), fields(service = %self.spec.service))]
    pub async fn tick(&self) {
        let snapshot = self.state.snapshot().await;
        match decide(snapshot.state, &snapshot.info, &snapshot.hash) {
            Decision::Idle => {}
            Decision::Rollback { target } => self.do_rollback(target).await,
            Decision::Pull => self.do_pull().await,
        }
    }

    async fn do_rollback(&self, target: String) {
        let git = self.git.clone();
        let target_for_git = target.clone();
        let result = tokio::task::spawn_blocking(move || git.rollback(&target_for_git)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "rollback failed");
                self.state.set_broken(e.to_string()).await;
                return;
            }
            Err(e) => {
                self.state.set_broken(e.to_string()).await;
                return;
            }
        }

        if let Err(e) = self.run_reload_and_act().await {
            self.state.set_broken(e).await;
            return;
        }

        let hash = self.current_hash().await;
        self.state.set_hash(hash).await;
        self.state.set_frozen(format!("ROLLBACK: {target}")).await;
    }

    async fn do_pull(&self) {
        let git = self.git.clone();
        let result = tokio::task::spawn_blocking(move || git.pull()).await;
        let changed = match result {
            Ok(Ok(changed)) => changed,
            Ok(Err(e)) => {
                warn!(error = %e, "pull failed");
                self.state.set_broken(e.to_string()).await;
                return;
            }
            Err(e) => {
                self.state.set_broken(e.to_string()).await;
                return;
            }
        };

        if !changed {
            info!("pull had no changes of interest");
            return;
        }

        let hash = self.current_hash().await;
        self.state.set_hash(hash).await;

        if let Err(e) = self.run_reload_and_act().await {
            self.state.set_broken(e).await;
            return;
        }
        self.state.set_ok("").await;
    }

    async fn run_reload_and_act(&self) -> Result<(), String> {
        let reload_ctl = self.service_ctl.clone();
        tokio::task::spawn_blocking(move || reload_ctl.reload())
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;

        let act_ctl = self.service_ctl.clone();
        tokio::task::spawn_blocking(move || act_ctl.act())
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn current_hash(&self) -> String {
        let git = self.git.clone();
        tokio::task::spawn_blocking(move || git.hash()).await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_ok_pulls() {
        assert_eq!(decide(State::Ok, "", ""), Decision::Pull);
    }

    #[test]
    fn decide_broken_retries_with_pull() {
        assert_eq!(decide(State::Broken, "some previous error", ""), Decision::Pull);
    }

    #[test]
    fn decide_frozen_is_idle() {
        assert_eq!(decide(State::Frozen, "", "abcd1234"), Decision::Idle);
    }

    #[test]
    fn decide_rollback_at_target_is_idle() {
        assert_eq!(decide(State::Rollback, "abcd1234", "abcd1234"), Decision::Idle);
    }

    #[test]
    fn decide_rollback_away_from_target_rolls_back() {
        assert_eq!(
            decide(State::Rollback, "deadbeef", "abcd1234"),
            Decision::Rollback { target: "deadbeef".to_string() }
        );
    }

    #[test]
    fn jittered_respects_lower_and_upper_bound() {
        let base = Duration::from_secs(10);
        for _ in 0..200 {
            let got = jittered(base);
            assert!(got >= base, "{got:?} should be >= {base:?}");
            assert!(got < base + base / 2, "{got:?} should be < {:?}", base + base / 2);
        }
    }

    #[test]
    fn jittered_zero_stays_zero() {
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn state_starts_ok_with_empty_hash() {
        let state = ReconcilerState::new("svc", Utc::now());
        let snap = state.snapshot().await;
        assert_eq!(snap.state, State::Ok);
        assert_eq!(snap.hash, "");
        assert_eq!(snap.info, "");
    }

    #[tokio::test]
    async fn set_frozen_updates_change_time() {
        let state = ReconcilerState::new("svc", Utc::now() - chrono::Duration::hours(1));
        let before = state.snapshot().await.change_time;
        state.set_frozen("").await;
        let after = state.snapshot().await.change_time;
        assert!(after > before);
        assert_eq!(state.snapshot().await.state, State::Frozen);
    }

    #[tokio::test]
    async fn pull_now_coalesces() {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let pull_now = PullNow(tx);
        pull_now.request();
        pull_now.request();
        pull_now.request();
        // Only one permit ever makes it through the single-slot channel.
        rx.try_recv().expect("first recv should succeed");
        assert!(rx.try_recv().is_err(), "second recv should find nothing pending");
    }
}
