//! # osutil
//!
//! Small host-identity helpers: the local hostname (for `--hosts` and
//! machine matching), the distro ID from `/etc/os-release` (for the
//! [`crate::ospkg`] installer factory), and uid/gid lookups (for privilege
//! drop in [`crate::git_worktree`] and chown in [`crate::bind_mount`]).

use std::path::Path;

use nix::unistd::User;

/// Verifies that the external binaries `GitWorktree`, `BindMounter`, and
/// `ServiceController` shell out to are actually on `PATH`, so a missing
/// prerequisite fails fast at startup rather than as a `GitError`/`MountError`
/// on the first reconcile tick.
pub fn check_prerequisites() -> Result<(), String> {
    for bin in ["git", "mount", "systemctl"] {
        which::which(bin).map_err(|_| format!("required binary {bin:?} not found on PATH"))?;
    }
    Ok(())
}

/// Returns the hostname of this host, falling back to `$HOSTNAME` if the
/// syscall fails for some reason (containers with a broken `/etc/hostname`).
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_default()
}

/// Parses the `ID=` line out of an `/etc/os-release`-format file. Takes a
/// path rather than hard-coding `/etc/os-release` so tests can point it at a
/// fixture.
pub fn os_release_id(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

/// Looks up `name` in the system user database, returning `(uid, gid)` of
/// its primary group on success.
pub fn lookup_user(name: &str) -> Option<(u32, u32)> {
    let user = User::from_name(name).ok().flatten()?;
    Some((user.uid.as_raw(), user.gid.as_raw()))
}

/// True when the current process is running with effective uid 0.
pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}
