//! # GitWorktree
//!
//! Wraps a sparse checkout rooted at `<mount>/<service>`, driven entirely
//! through the `git` CLI so behavior matches whatever `git` the host has
//! installed. Every invocation runs with `GIT_CONFIG_GLOBAL`/`GIT_CONFIG_SYSTEM`
//! pointed at `/dev/null` to isolate the checkout from operator-level config,
//! and increments the `git_ops_total`/`git_error_total` metrics.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;
use tracing::{debug, instrument};

use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to spawn git {args:?}: {source}")]
    Spawn {
        args: Vec<String>,
        #[source]
        source: std::io::Error,
    },
    #[error("git {args:?} exited with {status}: {stderr}")]
    NonZeroExit { args: Vec<String>, status: i32, stderr: String },
    #[error("unknown user {user:?}, cannot drop privileges")]
    UnknownUser { user: String },
}

/// One sparse Git checkout, owned exclusively by a single Reconciler.
#[derive(Debug, Clone)]
pub struct GitWorktree {
    service: String,
    upstream: String,
    branch: String,
    mount: PathBuf,
    links: Vec<String>,
    user: Option<String>,
}

impl GitWorktree {
    pub fn new(
        service: impl Into<String>,
        upstream: impl Into<String>,
        branch: impl Into<String>,
        mount: impl Into<PathBuf>,
        links: Vec<String>,
        user: Option<String>,
    ) -> Self {
        Self {
            service: service.into(),
            upstream: upstream.into(),
            branch: branch.into(),
            mount: mount.into(),
            links,
            user,
        }
    }

    /// The directory this worktree is (or will be) checked out into:
    /// `<mount>/<service>`.
    pub fn dir(&self) -> PathBuf {
        self.mount.join(&self.service)
    }

    pub fn is_checked_out(&self) -> bool {
        self.dir().join(".git").is_dir()
    }

    /// Clones `upstream` as a blobless, sparse, no-checkout clone into
    /// `dir()`, sets the sparse-checkout paths to the tracked `links`, then
    /// materializes them on disk.
    #[instrument(skip(self), fields(service = %self.service))]
    pub fn checkout(&self) -> Result<(), GitError> {
        let dir = self.dir();
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::create_dir_all(&dir).ok();
        if let Some(mode) = self.checkout_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(mode));
        }
        if crate::osutil::is_root() {
            if let Some(user) = &self.user {
                if let Some((uid, gid)) = crate::osutil::lookup_user(user) {
                    let _ = chown_path(&dir, uid, gid);
                }
            }
        }

        self.run(
            None,
            &[
                "clone",
                "--filter=blob:none",
                "--no-checkout",
                "--sparse",
                "-b",
                &self.branch,
                &self.upstream,
                &dir.display().to_string(),
            ],
        )?;

        let mut sparse_args = vec!["sparse-checkout".to_string(), "set".to_string()];
        sparse_args.extend(self.links.iter().cloned());
        let sparse_args: Vec<&str> = sparse_args.iter().map(String::as_str).collect();
        self.run(Some(&dir), &sparse_args)?;

        self.run(Some(&dir), &["checkout"])?;
        Ok(())
    }

    fn checkout_mode(&self) -> Option<u32> {
        Some(crate::constants::CHECKOUT_DIR_MODE)
    }

    /// Stashes any local edits, fetches, diffs `branch` against
    /// `origin/branch` (name-only), merges, and reports whether the diff
    /// touched a tracked sub-path.
    #[instrument(skip(self), fields(service = %self.service))]
    pub fn pull(&self) -> Result<bool, GitError> {
        let dir = self.dir();
        let _ = self.run(Some(&dir), &["stash"]);
        self.run(Some(&dir), &["fetch"])?;

        let remote_branch = format!("origin/{}", self.branch);
        let diff = self.run(Some(&dir), &["diff", "--name-only", &self.branch, &remote_branch])?;
        let changed = self.of_interest(&diff.stdout);

        self.run(Some(&dir), &["merge", &remote_branch])?;
        Ok(changed)
    }

    /// Stashes local edits then checks out `hash` directly.
    #[instrument(skip(self), fields(service = %self.service))]
    pub fn rollback(&self, hash: &str) -> Result<(), GitError> {
        let dir = self.dir();
        let _ = self.run(Some(&dir), &["stash"]);
        self.run(Some(&dir), &["checkout", hash])?;
        Ok(())
    }

    /// First 8 hex characters of `HEAD`, or empty string on any error.
    pub fn hash(&self) -> String {
        let dir = self.dir();
        match self.run(Some(&dir), &["rev-parse", "HEAD"]) {
            Ok(out) => {
                let full = String::from_utf8_lossy(&out.stdout);
                let trimmed = full.trim();
                trimmed.chars().take(crate::constants::SHORT_HASH_LEN).collect()
            }
            Err(_) => String::new(),
        }
    }

    /// True iff any line of `diff` output contains one of the tracked
    /// `link` strings as a substring. §4.1.1: direction-agnostic,
    /// exact-substring, short-circuits on first hit.
    fn of_interest(&self, diff: &[u8]) -> bool {
        let text = String::from_utf8_lossy(diff);
        for line in text.lines() {
            for link in &self.links {
                if line.contains(link.as_str()) {
                    return true;
                }
            }
        }
        false
    }

    fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<Output, GitError> {
        debug!(args = ?args, cwd = ?cwd, "running git");
        metrics::increment_git_ops(&self.service);

        let mut cmd = Command::new("git");
        cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
        cmd.env("GIT_CONFIG_SYSTEM", "/dev/null");
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        if let Some(user) = &self.user {
            if crate::osutil::is_root() {
                let (uid, gid) = crate::osutil::lookup_user(user)
                    .ok_or_else(|| GitError::UnknownUser { user: user.clone() })?;
                use std::os::unix::process::CommandExt;
                cmd.uid(uid);
                cmd.gid(gid);
            }
        }

        let output = cmd.output().map_err(|source| {
            metrics::increment_git_errors(&self.service);
            GitError::Spawn { args: args.iter().map(|s| s.to_string()).collect(), source }
        })?;

        if !output.status.success() {
            metrics::increment_git_errors(&self.service);
            return Err(GitError::NonZeroExit {
                args: args.iter().map(|s| s.to_string()).collect(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

fn chown_path(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    use nix::unistd::{chown, Gid, Uid};
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worktree(links: Vec<&str>) -> GitWorktree {
        GitWorktree::new(
            "svc",
            "https://example.com/repo.git",
            "main",
            "/tmp/gitfleet-test",
            links.into_iter().map(String::from).collect(),
            None,
        )
    }

    #[test]
    fn of_interest_matches_substring() {
        let g = worktree(vec!["grafana/etc"]);
        let diff = b" grafana/etc/file.yml | 3 +++\n 1 file changed, 3 insertions(+)\n";
        assert!(g.of_interest(diff));
    }

    #[test]
    fn of_interest_is_false_with_no_match() {
        let g = worktree(vec!["grafana/etc"]);
        let diff = b" README.md | 3 +++\n 1 file changed, 3 insertions(+)\n";
        assert!(!g.of_interest(diff));
    }

    #[test]
    fn of_interest_is_direction_agnostic() {
        let g = worktree(vec!["prometheus/rules"]);
        let diff = b"prometheus/rules/alerts.yml\n";
        assert!(g.of_interest(diff));
    }

    #[test]
    fn of_interest_short_circuits_on_first_hit() {
        let g = worktree(vec!["a/one", "b/two"]);
        let diff = b"unrelated line\nb/two/file\nalso unrelated\n";
        assert!(g.of_interest(diff));
    }

    #[test]
    fn is_checked_out_false_for_fresh_dir() {
        let dir = tempfile::tempdir().unwrap();
        let g = GitWorktree::new("svc", "https://example.com/repo.git", "main", dir.path(), vec![], None);
        assert!(!g.is_checked_out());
    }

    #[test]
    fn is_checked_out_true_when_dotgit_present() {
        let dir = tempfile::tempdir().unwrap();
        let svc_dir = dir.path().join("svc");
        std::fs::create_dir_all(svc_dir.join(".git")).unwrap();
        let g = GitWorktree::new("svc", "https://example.com/repo.git", "main", dir.path(), vec![], None);
        assert!(g.is_checked_out());
    }

    #[test]
    fn hash_is_empty_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let g = GitWorktree::new("svc", "https://example.com/repo.git", "main", dir.path(), vec![], None);
        assert_eq!(g.hash(), "");
    }
}
