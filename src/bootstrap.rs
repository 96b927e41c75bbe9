//! # Bootstrap
//!
//! The optional self-checkout described in §10.6: when any of
//! `--upstream`/`--dir`/`--branch`/`--mount`/`--pull` is passed, fetch the
//! repository holding the config file before `--config` is interpreted.
//! Initial-checkout failure is fatal; a failed refresh pull of an
//! already-bootstrapped directory is demoted to a warning.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::git_worktree::{GitError, GitWorktree};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("bootstrap checkout of {upstream} into {dir} failed: {source}")]
    Checkout {
        upstream: String,
        dir: String,
        #[source]
        source: GitError,
    },
}

/// Bootstrap flags as parsed off the CLI. `upstream` is the only field that
/// makes bootstrapping "active" — the others have sensible defaults.
#[derive(Debug, Clone)]
pub struct BootstrapSpec {
    pub upstream: String,
    pub dir: PathBuf,
    pub branch: String,
    pub mount: Option<PathBuf>,
    pub pull: bool,
}

/// Performs the self-checkout (or refresh pull) and returns the directory
/// the caller should now resolve `--config` against.
pub async fn run(spec: BootstrapSpec) -> Result<PathBuf, BootstrapError> {
    // `GitWorktree` always checks out into `<mount>/<service>`; bootstrap has
    // no "service" concept, so it points `mount` at the parent of `dir` (or
    // the explicit `--mount` override) and uses `dir`'s final path component
    // as the pseudo-service name.
    let service = spec
        .dir
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bootstrap".to_string());
    let mount = spec
        .mount
        .clone()
        .unwrap_or_else(|| spec.dir.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf));

    let worktree = GitWorktree::new(service, spec.upstream.clone(), spec.branch, mount, Vec::new(), None);

    if worktree.is_checked_out() {
        if spec.pull {
            let worktree_for_pull = worktree.clone();
            let pulled =
                tokio::task::spawn_blocking(move || worktree_for_pull.pull()).await.unwrap_or(Ok(false));
            if let Err(e) = pulled {
                warn!(error = %e, "bootstrap refresh pull failed, using existing checkout");
            }
        }
        return Ok(worktree.dir());
    }

    info!(upstream = %spec.upstream, dir = %worktree.dir().display(), "bootstrapping config checkout");
    let worktree_for_checkout = worktree.clone();
    tokio::task::spawn_blocking(move || worktree_for_checkout.checkout())
        .await
        .unwrap_or_else(|e| {
            Err(GitError::Spawn {
                args: vec!["clone".to_string()],
                source: std::io::Error::other(e.to_string()),
            })
        })
        .map_err(|source| BootstrapError::Checkout {
            upstream: spec.upstream,
            dir: worktree.dir().display().to_string(),
            source,
        })?;

    Ok(worktree.dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_derived_from_dir_basename() {
        let dir = PathBuf::from("/tmp/gitfleet-bootstrap/my-config");
        let name = dir.file_name().map(|s| s.to_string_lossy().into_owned());
        assert_eq!(name.as_deref(), Some("my-config"));
    }
}
