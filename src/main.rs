//! # gitfleetd
//!
//! The per-host agent binary. Parses CLI flags, optionally bootstraps its
//! own config checkout, loads and validates the config file, then hands off
//! to the [`gitfleet::supervisor::Supervisor`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gitfleet::bootstrap::{self, BootstrapSpec};
use gitfleet::config::Config;
use gitfleet::control_plane::ControlPlane;
use gitfleet::observability::{logging, metrics};
use gitfleet::supervisor::{ShutdownReason, Supervisor};
use gitfleet::{config_watcher, constants, osutil, server};

/// Per-host Git-backed reconciliation agent.
#[derive(Debug, Parser)]
#[command(name = "gitfleetd", about = "Reconciles local files and services against a Git-tracked config")]
struct Cli {
    /// Path to the TOML config file (required unless bootstrap flags resolve one).
    #[arg(long)]
    config: PathBuf,

    /// Control-channel bind address.
    #[arg(long, default_value = constants::DEFAULT_SSH_ADDR)]
    ssh_addr: String,

    /// Metrics/health bind address.
    #[arg(long, default_value = constants::DEFAULT_METRICS_ADDR)]
    metrics_addr: String,

    /// Additional host identities this agent answers to, beyond its own hostname.
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,

    /// Raise the log level to debug.
    #[arg(long)]
    debug: bool,

    /// Watch the config file for drift and request a restart (exit code 2) on change.
    #[arg(long)]
    restart: bool,

    /// Refuse to start unless running as root.
    #[arg(long, default_value_t = true)]
    require_root: bool,

    /// Poll interval between upstream pulls, before jitter. Defaults to
    /// `constants::DEFAULT_POLL_INTERVAL` (5 minutes) when not passed.
    #[arg(long, value_parser = parse_duration_secs)]
    poll: Option<Duration>,

    /// Bootstrap: Git URL of the repository holding the config file.
    #[arg(long)]
    upstream: Option<String>,
    /// Bootstrap: directory to check the config repository out into.
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Bootstrap: branch to track.
    #[arg(long, default_value = "main")]
    branch: String,
    /// Bootstrap: mount path, reserved for parity with the service-level `mount` field.
    #[arg(long)]
    mount: Option<PathBuf>,
    /// Bootstrap: refresh an existing bootstrap checkout instead of skipping it.
    #[arg(long)]
    pull: bool,
}

fn parse_duration_secs(s: &str) -> Result<Duration, String> {
    s.parse::<u64>().map(Duration::from_secs).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.debug);

    match run(cli).await {
        Ok(ShutdownReason::Clean) => {
            info!("clean shutdown");
            Ok(())
        }
        Ok(ShutdownReason::Restart) => {
            info!("exiting for restart (SIGHUP)");
            std::process::exit(constants::EXIT_RESTART);
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            std::process::exit(constants::EXIT_FATAL);
        }
    }
}

async fn run(cli: Cli) -> Result<ShutdownReason> {
    if cli.require_root && !osutil::is_root() {
        anyhow::bail!("gitfleetd requires root privileges (pass --require-root=false to override)");
    }
    osutil::check_prerequisites().map_err(|e| anyhow::anyhow!(e))?;

    metrics::register_metrics().context("failed to register prometheus metrics")?;

    let config_path = if let Some(upstream) = cli.upstream.clone() {
        let dir = cli.dir.clone().unwrap_or_else(|| PathBuf::from("/var/lib/gitfleet/bootstrap"));
        let checked_out = bootstrap::run(BootstrapSpec {
            upstream,
            dir,
            branch: cli.branch.clone(),
            mount: cli.mount.clone(),
            pull: cli.pull,
        })
        .await
        .context("bootstrap checkout failed")?;
        checked_out.join(&cli.config)
    } else {
        cli.config.clone()
    };

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let mut hosts: HashSet<String> = cli.hosts.iter().cloned().collect();
    hosts.insert(osutil::hostname());

    let ready = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();

    let poll_interval = cli.poll.unwrap_or(constants::DEFAULT_POLL_INTERVAL);
    let supervisor = Supervisor::new(poll_interval, ready.clone());
    let (registry, joins) = supervisor
        .start(&config, hosts, &cancel)
        .await
        .context("supervisor startup failed")?;

    let control_plane =
        Arc::new(ControlPlane::new(registry, &config.keys, osutil::hostname()).context("failed to load control-plane keys")?);

    let metrics_task = tokio::spawn({
        let addr = cli.metrics_addr.clone();
        let ready = ready.clone();
        async move {
            if let Err(e) = server::serve_metrics(&addr, ready).await {
                error!(error = %e, "metrics server exited");
            }
        }
    });

    let control_task = tokio::spawn({
        let addr = cli.ssh_addr.clone();
        let control_plane = control_plane.clone();
        async move {
            if let Err(e) = server::serve_control(&addr, control_plane).await {
                error!(error = %e, "control channel server exited");
            }
        }
    });

    let watcher_task = if cli.restart {
        let watch_cancel = cancel.clone();
        Some(tokio::spawn(config_watcher::watch(
            config_path.clone(),
            constants::CONFIG_WATCH_INTERVAL,
            watch_cancel,
        )))
    } else {
        None
    };

    let reason = Supervisor::wait_for_signal(&cancel).await;

    gitfleet::supervisor::drain(joins).await;
    metrics_task.abort();
    control_task.abort();
    if let Some(task) = watcher_task {
        task.abort();
    }

    Ok(reason)
}
