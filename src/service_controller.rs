//! # ServiceController
//!
//! Issues reload/restart verbs to the host's service manager (`systemctl`)
//! for one named unit, and can read back its last-start timestamp to seed
//! `ReconcilerState::change_time` on startup.

use std::process::Command;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to spawn systemctl {args:?}: {source}")]
    Spawn {
        args: Vec<String>,
        #[source]
        source: std::io::Error,
    },
    #[error("systemctl {args:?} exited with {status}")]
    NonZeroExit { args: Vec<String>, status: i32 },
}

#[derive(Debug, Clone)]
pub struct ServiceController {
    unit: String,
    action: String,
}

impl ServiceController {
    pub fn new(unit: impl Into<String>, action: impl Into<String>) -> Self {
        Self { unit: unit.into(), action: action.into() }
    }

    /// `systemctl daemon-reload`.
    #[instrument(skip(self), fields(unit = %self.unit))]
    pub fn reload(&self) -> Result<(), ServiceError> {
        run(&["daemon-reload"])
    }

    /// `systemctl <action> <unit>`. A no-op (always succeeds) when `action`
    /// is empty, per §4.3.
    #[instrument(skip(self), fields(unit = %self.unit, action = %self.action))]
    pub fn act(&self) -> Result<(), ServiceError> {
        if self.action.is_empty() {
            debug!("action is empty, nothing to do");
            return Ok(());
        }
        run(&[&self.action, &self.unit])
    }

    /// Queries `systemctl show -p ActiveEnterTimestamp` for this unit (or
    /// the kernel boot time when `unit` is empty) and parses it to UTC.
    /// Returns `None` when the unit is unknown or the timestamp can't be
    /// parsed, in which case callers fall back to "now".
    pub fn boot_time(&self) -> Option<DateTime<Utc>> {
        if self.unit.is_empty() {
            return kernel_boot_time();
        }
        let output = Command::new("systemctl")
            .args(["show", "-p", "ActiveEnterTimestamp", "--value", &self.unit])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_systemd_timestamp(text.trim())
    }
}

fn run(args: &[&str]) -> Result<(), ServiceError> {
    debug!(args = ?args, "running systemctl");
    let output = Command::new("systemctl")
        .args(args)
        .output()
        .map_err(|source| ServiceError::Spawn {
            args: args.iter().map(|s| s.to_string()).collect(),
            source,
        })?;
    if !output.status.success() {
        return Err(ServiceError::NonZeroExit {
            args: args.iter().map(|s| s.to_string()).collect(),
            status: output.status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// `systemctl show -p ActiveEnterTimestamp` emits e.g.
/// `Wed 2024-03-06 10:15:03 UTC`. Best-effort RFC-2822-ish parse; an empty
/// or "n/a" value (unit never started) yields `None`.
fn parse_systemd_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() || text == "n/a" {
        return None;
    }
    // Drop the leading weekday name ("Wed ") that systemd prefixes.
    let without_dow = text.splitn(2, ' ').nth(1).unwrap_or(text);
    DateTime::parse_from_str(&format!("{without_dow} +0000"), "%Y-%m-%d %H:%M:%S %Z %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn kernel_boot_time() -> Option<DateTime<Utc>> {
    let uptime = std::fs::read_to_string("/proc/uptime").ok()?;
    let seconds: f64 = uptime.split_whitespace().next()?.parse().ok()?;
    Some(Utc::now() - chrono::Duration::milliseconds((seconds * 1000.0) as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn act_with_empty_action_is_noop() {
        let ctl = ServiceController::new("grafana.service", "");
        assert!(ctl.act().is_ok());
    }

    #[test]
    fn parse_systemd_timestamp_rejects_na() {
        assert_eq!(parse_systemd_timestamp("n/a"), None);
    }

    #[test]
    fn parse_systemd_timestamp_rejects_empty() {
        assert_eq!(parse_systemd_timestamp(""), None);
    }

    #[test]
    fn parse_systemd_timestamp_parses_value() {
        let parsed = parse_systemd_timestamp("Wed 2024-03-06 10:15:03 UTC");
        assert!(parsed.is_some());
        assert_eq!(parsed.unwrap().format("%Y-%m-%d").to_string(), "2024-03-06");
    }
}
