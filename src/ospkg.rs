//! # ospkg
//!
//! OS package installer abstraction, keyed off `/etc/os-release`. The
//! Supervisor calls `Installer::install` once per service at startup, when
//! that service's `ServiceSpec::package` is set; a failure here is a
//! per-service warning, not fatal (§7).

use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with status {status}")]
    NonZeroExit { command: &'static str, status: std::process::ExitStatus },
}

pub trait Installer: std::fmt::Debug + Send + Sync {
    fn install(&self, pkg: &str) -> Result<(), InstallError>;
}

/// Picks an `Installer` for the running distribution, reading `ID=` from
/// `/etc/os-release`. Unrecognized distributions get the `NoopInstaller`
/// rather than a hard failure, matching the source tool's own leniency here.
pub fn detect() -> Box<dyn Installer> {
    detect_for(Path::new("/etc/os-release"))
}

fn detect_for(os_release: &Path) -> Box<dyn Installer> {
    match crate::osutil::os_release_id(os_release).as_deref() {
        Some("debian") | Some("ubuntu") => Box::new(DebianInstaller),
        Some("arch") => Box::new(ArchLinuxInstaller),
        other => {
            warn!(distro = ?other, "no package installer for this distribution, using no-op");
            Box::new(NoopInstaller)
        }
    }
}

const APT_GET: &str = "/usr/bin/apt-get";
const DPKG: &str = "/usr/bin/dpkg";

#[derive(Debug)]
pub struct DebianInstaller;

impl Installer for DebianInstaller {
    fn install(&self, pkg: &str) -> Result<(), InstallError> {
        let already = Command::new(DPKG)
            .args(["-s", pkg])
            .status()
            .map_err(|source| InstallError::Spawn { command: DPKG, source })?;
        if already.success() {
            return Ok(());
        }

        let status = Command::new(APT_GET)
            .args(["-qq", "--assume-yes", "--no-install-recommends", "install", pkg])
            .status()
            .map_err(|source| InstallError::Spawn { command: APT_GET, source })?;
        if !status.success() {
            return Err(InstallError::NonZeroExit { command: APT_GET, status });
        }
        Ok(())
    }
}

const PACMAN: &str = "/usr/bin/pacman";

#[derive(Debug)]
pub struct ArchLinuxInstaller;

impl Installer for ArchLinuxInstaller {
    fn install(&self, pkg: &str) -> Result<(), InstallError> {
        let already = Command::new(PACMAN)
            .args(["-Qi", pkg])
            .status()
            .map_err(|source| InstallError::Spawn { command: PACMAN, source })?;
        if already.success() {
            return Ok(());
        }

        let status = Command::new(PACMAN)
            .args(["-S", "--noconfirm", pkg])
            .status()
            .map_err(|source| InstallError::Spawn { command: PACMAN, source })?;
        if !status.success() {
            return Err(InstallError::NonZeroExit { command: PACMAN, status });
        }
        Ok(())
    }
}

/// No-op installer for hosts whose necessary executables are already present.
#[derive(Debug)]
pub struct NoopInstaller;

impl Installer for NoopInstaller {
    fn install(&self, _pkg: &str) -> Result<(), InstallError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn detects_debian() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "ID=debian").unwrap();
        assert_eq!(format!("{:?}", detect_for(f.path())), "DebianInstaller");
    }

    #[test]
    fn detects_arch() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "ID=arch").unwrap();
        assert_eq!(format!("{:?}", detect_for(f.path())), "ArchLinuxInstaller");
    }

    #[test]
    fn unknown_distro_is_noop() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "ID=plan9").unwrap();
        assert_eq!(format!("{:?}", detect_for(f.path())), "NoopInstaller");
    }

    #[test]
    fn noop_installer_always_succeeds() {
        assert!(NoopInstaller.install("anything").is_ok());
    }
}
