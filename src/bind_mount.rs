//! # BindMounter
//!
//! Idempotently bind-mounts the non-empty `dir.local` targets of a
//! [`crate::config::ServiceSpec`] onto their corresponding checked-out
//! sub-paths, creating and chown-ing the target directories as needed.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::DirMapping;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to create mount target {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read mount table: {0}")]
    MountTable(std::io::Error),
    #[error("failed to spawn mount --bind {source_dir} {target}: {error}")]
    Spawn { source_dir: PathBuf, target: PathBuf, error: std::io::Error },
    #[error("mount --bind {source_dir} {target} exited with {status}")]
    NonZeroExit { source_dir: PathBuf, target: PathBuf, status: i32 },
}

#[derive(Debug, Clone)]
pub struct BindMounter {
    worktree_dir: PathBuf,
    user: Option<String>,
}

impl BindMounter {
    pub fn new(worktree_dir: impl Into<PathBuf>, user: Option<String>) -> Self {
        Self { worktree_dir: worktree_dir.into(), user }
    }

    /// Ensures every `dir.local` (when non-empty) is a writable bind mount
    /// over `<worktree_dir>/<dir.link>`. Returns the number of mounts
    /// actually performed (i.e. excluding already-mounted targets) — a
    /// non-zero count tells the Supervisor to kick the service even when
    /// the git hash hasn't changed.
    #[instrument(skip(self, dirs))]
    pub fn ensure(&self, dirs: &[DirMapping]) -> Result<usize, MountError> {
        let mounted = mount_table()?;
        let mut performed = 0;
        for dir in dirs {
            if dir.local.is_empty() {
                continue;
            }
            let local = PathBuf::from(&dir.local);
            let gitdir = self.worktree_dir.join(&dir.link);

            if !local.exists() {
                std::fs::create_dir_all(&local)
                    .map_err(|source| MountError::CreateDir { path: local.clone(), source })?;
                self.set_mode_and_owner(&local);
            }

            if mounted.contains(&canonical(&local)) {
                debug!(target = %local.display(), "already a mount point, skipping");
                continue;
            }

            self.bind(&gitdir, &local)?;
            performed += 1;
        }
        Ok(performed)
    }

    fn set_mode_and_owner(&self, path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(
            path,
            std::fs::Permissions::from_mode(crate::constants::BIND_TARGET_MODE),
        );
        if crate::osutil::is_root() {
            if let Some(user) = &self.user {
                if let Some((uid, gid)) = crate::osutil::lookup_user(user) {
                    use nix::unistd::{chown, Gid, Uid};
                    let _ = chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)));
                }
            }
        }
    }

    fn bind(&self, source: &Path, target: &Path) -> Result<(), MountError> {
        info!(source = %source.display(), target = %target.display(), "bind-mounting");
        let status = Command::new("mount")
            .args(["--bind", &source.display().to_string(), &target.display().to_string()])
            .status()
            .map_err(|error| MountError::Spawn {
                source_dir: source.to_path_buf(),
                target: target.to_path_buf(),
                error,
            })?;
        if !status.success() {
            return Err(MountError::NonZeroExit {
                source_dir: source.to_path_buf(),
                target: target.to_path_buf(),
                status: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Reads `/proc/self/mounts` and returns the set of already-mounted target
/// paths, so `ensure` can treat re-running on an already-mounted host as a
/// no-op.
fn mount_table() -> Result<std::collections::HashSet<PathBuf>, MountError> {
    let text = match std::fs::read_to_string("/proc/self/mounts") {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Default::default()),
        Err(e) => return Err(MountError::MountTable(e)),
    };
    let mut set = std::collections::HashSet::new();
    for line in text.lines() {
        if let Some(target) = line.split_whitespace().nth(1) {
            set.insert(canonical(Path::new(target)));
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_skips_empty_local() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = BindMounter::new(dir.path(), None);
        let dirs = vec![DirMapping { local: String::new(), link: "svc/etc".to_string() }];
        let performed = mounter.ensure(&dirs).unwrap();
        assert_eq!(performed, 0);
    }

    #[test]
    fn ensure_creates_missing_target_dir() {
        let worktree = tempfile::tempdir().unwrap();
        let targets = tempfile::tempdir().unwrap();
        let local = targets.path().join("missing-subdir");
        let mounter = BindMounter::new(worktree.path(), None);
        let dirs = vec![DirMapping { local: local.display().to_string(), link: "svc/etc".to_string() }];

        // `mount` will fail in this sandboxed test environment (no CAP_SYS_ADMIN),
        // but the directory creation step must still happen before that.
        let _ = mounter.ensure(&dirs);
        assert!(local.is_dir());
    }
}
