//! # ConfigWatcher
//!
//! Spawned only when `--restart` is passed. Re-hashes the config file every
//! [`crate::constants::CONFIG_WATCH_INTERVAL`] and raises `SIGHUP` against
//! its own process on drift, which `Supervisor::wait_for_signal` turns into
//! the exit-code-2 restart path of §4.5.

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigWatchError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn digest(path: &std::path::Path) -> Result<[u8; 32], ConfigWatchError> {
    let bytes = std::fs::read(path)
        .map_err(|source| ConfigWatchError::Io { path: path.display().to_string(), source })?;
    Ok(Sha256::digest(bytes).into())
}

/// Runs until `cancel` fires, polling `path`'s SHA-256 digest and raising
/// `SIGHUP` on the first observed change.
pub async fn watch(path: PathBuf, interval: std::time::Duration, cancel: CancellationToken) {
    let baseline = match digest(&path) {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "config watcher could not read baseline digest, disabling watch");
            return;
        }
    };

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
        if cancel.is_cancelled() {
            return;
        }

        match digest(&path) {
            Ok(current) if current != baseline => {
                info!(path = %path.display(), "config file changed, requesting restart");
                raise_sighup();
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "config watcher failed to read digest, will retry next tick"),
        }
    }
}

fn raise_sighup() {
    if let Err(e) = nix::sys::signal::raise(nix::sys::signal::Signal::SIGHUP) {
        warn!(error = %e, "failed to raise SIGHUP");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_changes_when_contents_change() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut f, b"one").unwrap();
        let before = digest(f.path()).unwrap();

        std::io::Write::write_all(&mut f, b"two").unwrap();
        let after = digest(f.path()).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn digest_missing_file_errors() {
        let err = digest(std::path::Path::new("/nonexistent/gitfleet-config-watch-test"));
        assert!(err.is_err());
    }
}
