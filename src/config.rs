//! # Config
//!
//! Parses and validates the TOML configuration document: a `[global]` section of
//! defaults plus an array of `[[services]]`. Unknown fields are rejected outright so a
//! typo in a service entry fails loudly at startup rather than being silently ignored.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("service #{index} ({service:?}) has empty {field}")]
    MissingField {
        index: usize,
        service: String,
        field: &'static str,
    },
    #[error("duplicate service {service:?} on host {machine:?}")]
    DuplicateService { machine: String, service: String },
}

/// One `{ local, link }` entry under a service's `dirs` array.
///
/// `link` is a relative path inside the worktree, sparsely checked out and bind-mounted.
/// `local` is the absolute host path the link is mounted onto; when empty, the link is
/// tracked (checked out, watched for diffs) but never mounted anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DirMapping {
    #[serde(default)]
    pub local: String,
    pub link: String,
}

/// One authorized credential for the control channel: an OpenSSH-format public
/// key file plus whether its caller is restricted to read-only (`/list/*`) routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KeySpec {
    pub path: PathBuf,
    #[serde(default)]
    pub ro: bool,
}

/// Raw per-service fields as they appear in TOML, before merging with `[global]`. Every
/// field is optional here; `Config::load` fills gaps from the global defaults and then
/// validates the merged result.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpecRaw {
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub mount: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub dirs: Vec<DirMapping>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSpec {
    #[serde(flatten)]
    pub defaults: ServiceSpecRaw,
    #[serde(default)]
    pub keys: Vec<KeySpec>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub global: GlobalSpec,
    #[serde(default)]
    pub services: Vec<ServiceSpecRaw>,
}

/// A fully merged, validated service entry. Immutable once built — see §3 of the design
/// document for the invariants this type upholds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceSpec {
    pub machine: String,
    pub service: String,
    pub upstream: String,
    pub branch: String,
    pub mount: String,
    pub user: Option<String>,
    pub package: Option<String>,
    pub action: String,
    pub dirs: Vec<DirMapping>,
}

const DEFAULT_BRANCH: &str = "main";

fn merge_field(service: Option<String>, global: &Option<String>) -> Option<String> {
    service.or_else(|| global.clone())
}

fn merge(global: &ServiceSpecRaw, raw: ServiceSpecRaw) -> ServiceSpecRaw {
    ServiceSpecRaw {
        machine: if raw.machine.is_empty() { global.machine.clone() } else { raw.machine },
        service: if raw.service.is_empty() { global.service.clone() } else { raw.service },
        upstream: if raw.upstream.is_empty() { global.upstream.clone() } else { raw.upstream },
        branch: merge_field(raw.branch, &global.branch),
        mount: if raw.mount.is_empty() { global.mount.clone() } else { raw.mount },
        user: merge_field(raw.user, &global.user),
        package: merge_field(raw.package, &global.package),
        action: merge_field(raw.action, &global.action),
        dirs: if raw.dirs.is_empty() { global.dirs.clone() } else { raw.dirs },
    }
}

fn require_non_empty(
    value: &str,
    index: usize,
    service: &str,
    field: &'static str,
) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::MissingField { index, service: service.to_string(), field });
    }
    Ok(())
}

/// The fully parsed and validated configuration document.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub keys: Vec<KeySpec>,
    pub services: Vec<ServiceSpec>,
}

impl Config {
    /// Reads, parses, merges, and validates the config file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&text, &path.display().to_string())
    }

    fn from_str(text: &str, path_label: &str) -> Result<Config, ConfigError> {
        let raw: RawConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path_label.to_string(),
            source,
        })?;
        raw.into_config()
    }

    /// Parses an in-memory config document. Used by tests and by the bootstrap
    /// path, which reads the config out of a freshly-checked-out worktree
    /// rather than an arbitrary filesystem path.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        Self::from_str(text, "<memory>")
    }
}

impl RawConfig {
    /// Merges every service with `global`, validates the documented invariants, and
    /// rejects duplicate `(machine, service)` pairs — the same service name is fine
    /// on two different hosts, but not twice on one.
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let RawConfig { global, services } = self;
        let mut merged = Vec::with_capacity(services.len());
        let mut seen = HashSet::new();

        for (index, raw) in services.into_iter().enumerate() {
            let m = merge(&global.defaults, raw);

            require_non_empty(&m.machine, index, &m.service, "machine")?;
            require_non_empty(&m.upstream, index, &m.service, "upstream")?;
            require_non_empty(&m.mount, index, &m.service, "mount")?;
            require_non_empty(&m.service, index, &m.service, "service")?;
            for dir in &m.dirs {
                require_non_empty(&dir.link, index, &m.service, "dirs[].link")?;
            }

            if !seen.insert((m.machine.clone(), m.service.clone())) {
                return Err(ConfigError::DuplicateService { machine: m.machine, service: m.service });
            }

            merged.push(ServiceSpec {
                machine: m.machine,
                service: m.service,
                upstream: m.upstream,
                branch: m.branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
                mount: m.mount,
                user: m.user,
                package: m.package,
                action: m.action.unwrap_or_default(),
                dirs: m.dirs,
            });
        }

        Ok(Config { keys: global.keys, services: merged })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
[global]
upstream = "https://github.com/miekg/gitopper-config"
mount = "/tmp"

[[services]]
machine = "localhost"
branch = "main"
service = "prometheus"
user = "grafana"
package = "grafana"
action = "reload"
dirs = [
    { local = "/etc/prometheus", link = "prometheus/etc" },
]
"#;

    const INVALID_UNKNOWN_FIELD: &str = r#"
[global]
upstream = "https://github.com/miekg/gitopper-config"
mount = "/tmp"

[[services]]
machine = "localhost"
brokenbranch = "main"
service = "prometheus"
"#;

    #[test]
    fn parses_valid_config() {
        let cfg = Config::parse(VALID).expect("expected to parse config");
        assert_eq!(cfg.services.len(), 1);
        let svc = &cfg.services[0];
        assert_eq!(svc.machine, "localhost");
        assert_eq!(svc.service, "prometheus");
        assert_eq!(svc.upstream, "https://github.com/miekg/gitopper-config");
        assert_eq!(svc.branch, "main");
        assert_eq!(svc.action, "reload");
        assert_eq!(svc.dirs[0].link, "prometheus/etc");
    }

    #[test]
    fn rejects_unknown_field() {
        let err = Config::parse(INVALID_UNKNOWN_FIELD);
        assert!(err.is_err(), "expected unknown field to fail parsing");
    }

    #[test]
    fn defaults_branch_to_main() {
        let cfg = Config::parse(
            r#"
[global]
upstream = "https://example.com/repo"
mount = "/tmp"
[[services]]
machine = "h1"
service = "svc"
dirs = [{ link = "svc/etc" }]
"#,
        )
        .expect("config should parse");
        assert_eq!(cfg.services[0].branch, "main");
    }

    #[test]
    fn duplicate_service_is_rejected() {
        let raw: RawConfig = toml::from_str(
            r#"
[global]
upstream = "https://example.com/repo"
mount = "/tmp"
[[services]]
machine = "h1"
service = "svc"
dirs = [{ link = "svc/etc" }]
[[services]]
machine = "h1"
service = "svc"
dirs = [{ link = "svc/etc2" }]
"#,
        )
        .unwrap();
        let err = raw.into_config().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateService { .. }));
    }

    #[test]
    fn missing_upstream_is_rejected() {
        let raw: RawConfig = toml::from_str(
            r#"
[global]
mount = "/tmp"
[[services]]
machine = "h1"
service = "svc"
dirs = [{ link = "svc/etc" }]
"#,
        )
        .unwrap();
        let err = raw.into_config().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "upstream", .. }));
    }

    #[test]
    fn round_trips_field_wise() {
        let cfg = Config::parse(VALID).unwrap();
        let svc = &cfg.services[0];
        let json = serde_json::to_string(svc).unwrap();
        let back: ServiceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(*svc, back);
    }
}
