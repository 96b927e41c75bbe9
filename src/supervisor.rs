//! # Supervisor
//!
//! Builds one [`Reconciler`] per [`ServiceSpec`] that matches this host's
//! identities, sequences the startup steps of §4.5 (package install →
//! checkout → bind-mount → initial kick → loop launch), and owns the
//! top-level signal handling that turns INT/TERM/HUP into a coordinated
//! shutdown or restart.
//!
//! Startup hands back a [`ServiceRegistry`] — the read-mostly view the
//! ControlPlane and HTTP listing routes share — plus the loop task handles,
//! which only `main` needs, to drain on shutdown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::{Config, ServiceSpec};
use crate::ospkg;
use crate::reconciler::{PullNow, Reconciler, ReconcilerState};
use crate::service_controller::ServiceController;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("duplicate service {service:?} on host {machine:?}")]
    DuplicateService { machine: String, service: String },
}

/// One running service, as seen by the ControlPlane and the HTTP listing
/// routes: the Reconciler for state reads, and a pull-now handle for writes.
pub struct ServiceEntry {
    pub reconciler: Arc<Reconciler>,
    pull_now: PullNow,
}

impl ServiceEntry {
    pub fn request_pull(&self) {
        self.pull_now.request();
    }
}

/// The fixed set of services this agent is managing, plus the host
/// identities it answers to. Built once by [`Supervisor::start`] and shared
/// read-only thereafter.
pub struct ServiceRegistry {
    hosts: HashSet<String>,
    entries: Vec<ServiceEntry>,
}

impl ServiceRegistry {
    pub fn hosts(&self) -> &HashSet<String> {
        &self.hosts
    }

    pub fn entries(&self) -> &[ServiceEntry] {
        &self.entries
    }

    pub fn find(&self, service: &str) -> Option<&ServiceEntry> {
        self.entries.iter().find(|e| e.reconciler.spec().service == service)
    }
}

/// Signal the Supervisor observed from the process, reported back to `main`
/// so it can choose the exit code from §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// INT or TERM: clean shutdown, exit 0.
    Clean,
    /// HUP: config changed, relaunch me, exit 2.
    Restart,
}

pub struct Supervisor {
    poll_interval: Duration,
    ready: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(poll_interval: Duration, ready: Arc<AtomicBool>) -> Self {
        Self { poll_interval, ready }
    }

    pub fn readiness(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    fn matches_host(hosts: &HashSet<String>, spec: &ServiceSpec) -> bool {
        hosts.contains(&spec.machine)
    }

    /// Runs the full startup sequence of §4.5 for every service whose
    /// `machine` is in `hosts`, then spawns each Reconciler's loop task.
    /// Flips the readiness flag once every matching service has been
    /// attempted (successfully or not — a BROKEN service is still "ready"
    /// in the liveness/readiness sense, it's simply not healthy).
    #[instrument(skip(self, config, cancel))]
    pub async fn start(
        &self,
        config: &Config,
        hosts: HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<(Arc<ServiceRegistry>, Vec<JoinHandle<()>>), SupervisorError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut joins = Vec::new();

        for spec in &config.services {
            if !Self::matches_host(&hosts, spec) {
                continue;
            }
            if !seen.insert((spec.machine.clone(), spec.service.clone())) {
                return Err(SupervisorError::DuplicateService {
                    machine: spec.machine.clone(),
                    service: spec.service.clone(),
                });
            }
            let (entry, join) = self.start_one(spec.clone(), cancel).await;
            entries.push(entry);
            joins.push(join);
        }

        self.ready.store(true, Ordering::SeqCst);
        Ok((Arc::new(ServiceRegistry { hosts, entries }), joins))
    }

    async fn start_one(&self, spec: ServiceSpec, cancel: &CancellationToken) -> (ServiceEntry, JoinHandle<()>) {
        let service = spec.service.clone();

        if let Some(pkg) = spec.package.clone() {
            let installer = ospkg::detect();
            if let Err(e) = installer.install(&pkg) {
                warn!(service = %service, error = %e, "package install failed, continuing anyway");
            }
        }

        // §3: change_time is seeded from the unit's last-start timestamp when
        // the service manager knows it, falling back to "now" for a unit
        // that has never started (or whose manager can't be queried yet).
        let boot_ctl = ServiceController::new(spec.service.clone(), spec.action.clone());
        let change_time = tokio::task::spawn_blocking(move || boot_ctl.boot_time())
            .await
            .ok()
            .flatten()
            .unwrap_or_else(Utc::now);
        let state = Arc::new(ReconcilerState::new(service.clone(), change_time));
        let (reconciler, pull_now, pull_rx) = Reconciler::new(spec, state.clone(), self.poll_interval);
        let reconciler = Arc::new(reconciler);

        // §3/§4.1: the worktree persists across restarts and is re-used when
        // `mount/service/.git` already exists — `checkout()` runs `git clone`
        // into that directory and aborts if it's non-empty, so a restart must
        // not re-run it. Bind-mounting and the initial service kick are only
        // meaningful the first time this service is ever set up; on a restart
        // the mounts and the running service are already in place.
        let fresh_checkout = !reconciler.git().is_checked_out();
        if fresh_checkout {
            if let Err(e) = reconciler.git().checkout() {
                error!(service = %service, error = %e, "initial checkout failed");
                state.set_broken(e.to_string()).await;
                return (ServiceEntry { reconciler: reconciler.clone(), pull_now }, spawn_noop());
            }
        }

        let hash = {
            let git = reconciler.git().clone();
            tokio::task::spawn_blocking(move || git.hash()).await.unwrap_or_default()
        };
        state.set_hash(hash).await;

        if fresh_checkout {
            let fresh_mounts = match reconciler.mounter().ensure(&reconciler.spec().dirs) {
                Ok(n) => n,
                Err(e) => {
                    error!(service = %service, error = %e, "bind-mount setup failed");
                    state.set_broken(e.to_string()).await;
                    return (ServiceEntry { reconciler: reconciler.clone(), pull_now }, spawn_noop());
                }
            };

            if fresh_mounts > 0 {
                let ctl = reconciler.service_controller().clone();
                let result = tokio::task::spawn_blocking(move || ctl.act()).await;
                let failure = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(msg) = failure {
                    warn!(service = %service, error = %msg, "initial service kick failed, a future pull may repair");
                    state.set_broken(msg).await;
                }
            }
        }

        let loop_reconciler = reconciler.clone();
        let loop_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            loop_reconciler.run(pull_rx, loop_cancel).await;
        });

        (ServiceEntry { reconciler, pull_now }, join)
    }

    /// Blocks until INT, TERM, or HUP is received, cancels `cancel`, and
    /// reports which kind of shutdown this was.
    pub async fn wait_for_signal(cancel: &CancellationToken) -> ShutdownReason {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut int = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
            let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
            let mut hup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");

            let reason = tokio::select! {
                _ = int.recv() => { info!("received SIGINT"); ShutdownReason::Clean }
                _ = term.recv() => { info!("received SIGTERM"); ShutdownReason::Clean }
                _ = hup.recv() => { info!("received SIGHUP, will exit for restart"); ShutdownReason::Restart }
            };
            cancel.cancel();
            reason
        }
        #[cfg(not(unix))]
        {
            let _ = cancel;
            unimplemented!("gitfleetd only supports unix signal handling")
        }
    }
}

/// A trivially-completed task, used as the join handle for a service that
/// never made it past startup (so `drain` still has something to await).
fn spawn_noop() -> JoinHandle<()> {
    tokio::spawn(async {})
}

/// Awaits every loop task. Call after cancelling, once `wait_for_signal`
/// returns.
pub async fn drain(joins: Vec<JoinHandle<()>>) {
    for join in joins {
        let _ = join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirMapping;

    fn spec(machine: &str, service: &str) -> ServiceSpec {
        ServiceSpec {
            machine: machine.to_string(),
            service: service.to_string(),
            upstream: "https://example.com/repo.git".to_string(),
            branch: "main".to_string(),
            mount: "/tmp/gitfleet-supervisor-test".to_string(),
            user: None,
            package: None,
            action: String::new(),
            dirs: vec![DirMapping { local: String::new(), link: format!("{service}/etc") }],
        }
    }

    #[tokio::test]
    async fn start_one_skips_checkout_when_already_checked_out() {
        // §3/§4.1: a restart must re-use an existing worktree rather than
        // re-running `checkout()` (which would try to `git clone` into an
        // already-populated directory and fail). Simulate a prior checkout by
        // pre-creating `mount/service/.git`, then confirm `start_one` leaves
        // the service out of BROKEN even though no real `git`/`mount` state
        // backs this fixture.
        let mount = tempfile::tempdir().unwrap();
        let mut s = spec("h1", "restart-test");
        s.mount = mount.path().display().to_string();
        std::fs::create_dir_all(mount.path().join(&s.service).join(".git")).unwrap();

        let cancel = CancellationToken::new();
        let supervisor = Supervisor::new(Duration::from_secs(1), Arc::new(AtomicBool::new(false)));
        let (entry, join) = supervisor.start_one(s, &cancel).await;
        join.abort();

        let snap = entry.reconciler.state().snapshot().await;
        assert_ne!(snap.state, crate::reconciler::State::Broken);
    }

    #[test]
    fn matches_host_is_set_membership() {
        let hosts: HashSet<String> = ["h1".to_string(), "h2".to_string()].into_iter().collect();
        assert!(Supervisor::matches_host(&hosts, &spec("h1", "svc")));
        assert!(!Supervisor::matches_host(&hosts, &spec("h3", "svc")));
    }
}
