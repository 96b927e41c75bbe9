//! # ControlPlane
//!
//! Turns authenticated external requests into in-process calls on
//! [`Reconciler`]s: listing machines/services, freezing, unfreezing, rolling
//! back, and requesting an immediate pull. See §4.6/§6 and DESIGN.md for why
//! the "authenticated, connection-oriented" control channel is realized as
//! an `axum`-served HTTP API rather than a real SSH daemon.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ssh_key::PublicKey;
use thiserror::Error;

use crate::config::KeySpec;
use crate::reconciler::State;
use crate::supervisor::ServiceRegistry;

/// The namespace string passed to `PublicKey::verify`, mirroring
/// `ssh-keygen -Y sign/verify -n <namespace>`.
const AUTH_NAMESPACE: &str = "gitfleet-control-plane";

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("missing or malformed Authorization header")]
    Unauthorized,
    #[error("credential is read-only, write verbs are forbidden")]
    ReadOnly,
    #[error("unknown service {0:?}")]
    UnknownService(String),
    #[error("{0:?} is not a valid hex commit hash")]
    InvalidHash(String),
    #[error("failed to load public key {path}: {source}")]
    KeyLoad {
        path: String,
        #[source]
        source: ssh_key::Error,
    },
}

/// One public key loaded from `global.keys`, paired with its read-only flag.
struct LoadedKey {
    public_key: PublicKey,
    read_only: bool,
}

/// Parses every `KeySpec` in the config's `global.keys` list into an
/// OpenSSH public key. Called once at startup; a malformed key file is a
/// fatal config error, same as any other `Config` invariant violation.
fn load_keys(keys: &[KeySpec]) -> Result<Vec<LoadedKey>, ControlPlaneError> {
    keys.iter()
        .map(|k| {
            let public_key =
                PublicKey::read_openssh_file(&k.path).map_err(|source| ControlPlaneError::KeyLoad {
                    path: k.path.display().to_string(),
                    source,
                })?;
            Ok(LoadedKey { public_key, read_only: k.ro })
        })
        .collect()
}

/// The outcome of a successful authentication: which credential matched,
/// and whether it's restricted to read-only verbs.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub read_only: bool,
}

impl AuthContext {
    fn require_write(self) -> Result<(), ControlPlaneError> {
        if self.read_only {
            return Err(ControlPlaneError::ReadOnly);
        }
        Ok(())
    }
}

/// Verifies the `Authorization` header against the loaded keys.
///
/// The header carries `Bearer <hex>` or `Signature <hex>` (either prefix is
/// accepted identically), where `<hex>` is the hex encoding of a
/// `SSHSIG`-format PEM-armored signature (the output of
/// `ssh-keygen -Y sign -n gitfleet-control-plane`, hex-encoded for
/// header-safe transport) over `message`.
pub fn authenticate(
    keys: &[LoadedKey],
    message: &[u8],
    authorization_header: Option<&str>,
) -> Result<AuthContext, ControlPlaneError> {
    let header = authorization_header.ok_or(ControlPlaneError::Unauthorized)?;
    let hex_part = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("Signature "))
        .ok_or(ControlPlaneError::Unauthorized)?;

    let pem_bytes = hex_decode(hex_part).ok_or(ControlPlaneError::Unauthorized)?;
    let pem_text = String::from_utf8(pem_bytes).map_err(|_| ControlPlaneError::Unauthorized)?;
    let signature = ssh_key::SshSig::from_pem(pem_text).map_err(|_| ControlPlaneError::Unauthorized)?;

    for key in keys {
        if key.public_key.verify(AUTH_NAMESPACE, message, &signature).is_ok() {
            return Ok(AuthContext { read_only: key.read_only });
        }
    }
    Err(ControlPlaneError::Unauthorized)
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

/// One row of a `/list/machine` response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MachineList {
    pub hostname: String,
    pub machines: Vec<String>,
}

/// One row of a `/list/service` response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceListing {
    pub service: String,
    pub hash: String,
    pub state: State,
    pub info: String,
    pub change_time: DateTime<Utc>,
}

pub struct ControlPlane {
    registry: Arc<ServiceRegistry>,
    keys: Vec<LoadedKey>,
    hostname: String,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        raw_keys: &[KeySpec],
        hostname: String,
    ) -> Result<Self, ControlPlaneError> {
        Ok(Self { registry, keys: load_keys(raw_keys)?, hostname })
    }

    pub fn authenticate(&self, message: &[u8], header: Option<&str>) -> Result<AuthContext, ControlPlaneError> {
        authenticate(&self.keys, message, header)
    }

    /// `list machines`: every distinct `machine` this agent answers to,
    /// alongside its real hostname.
    pub fn list_machines(&self) -> MachineList {
        let mut machines: Vec<String> = self.registry.hosts().iter().cloned().collect();
        machines.sort();
        MachineList { hostname: self.hostname.clone(), machines }
    }

    /// `list services [<service>]`.
    pub async fn list_services(&self, filter: Option<&str>) -> Result<Vec<ServiceListing>, ControlPlaneError> {
        let mut out = Vec::new();
        for entry in self.registry.entries() {
            let spec = entry.reconciler.spec();
            if let Some(name) = filter {
                if spec.service != name {
                    continue;
                }
            }
            let snapshot = entry.reconciler.state().snapshot().await;
            out.push(ServiceListing {
                service: spec.service.clone(),
                hash: snapshot.hash,
                state: snapshot.state,
                info: snapshot.info,
                change_time: snapshot.change_time,
            });
        }
        if let Some(name) = filter {
            if out.is_empty() {
                return Err(ControlPlaneError::UnknownService(name.to_string()));
            }
        }
        Ok(out)
    }

    fn find(&self, service: &str) -> Result<&crate::supervisor::ServiceEntry, ControlPlaneError> {
        self.registry.find(service).ok_or_else(|| ControlPlaneError::UnknownService(service.to_string()))
    }

    pub async fn freeze(&self, auth: AuthContext, service: &str) -> Result<(), ControlPlaneError> {
        auth.require_write()?;
        let entry = self.find(service)?;
        entry.reconciler.state().set_frozen("").await;
        Ok(())
    }

    pub async fn unfreeze(&self, auth: AuthContext, service: &str) -> Result<(), ControlPlaneError> {
        auth.require_write()?;
        let entry = self.find(service)?;
        entry.reconciler.state().set_ok("").await;
        Ok(())
    }

    pub async fn rollback(&self, auth: AuthContext, service: &str, hash: &str) -> Result<(), ControlPlaneError> {
        auth.require_write()?;
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ControlPlaneError::InvalidHash(hash.to_string()));
        }
        let entry = self.find(service)?;
        entry.reconciler.state().set_rollback(hash).await;
        entry.request_pull();
        Ok(())
    }

    pub async fn pull(&self, auth: AuthContext, service: &str) -> Result<(), ControlPlaneError> {
        auth.require_write()?;
        let entry = self.find(service)?;
        entry.request_pull();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `ServiceRegistry` has no public empty constructor by design (it's
    // always the output of a startup pass); build one from a zero-service
    // config so these tests stay synchronous and subprocess-free.
    async fn empty_registry() -> Arc<ServiceRegistry> {
        let hosts: std::collections::HashSet<String> = std::collections::HashSet::new();
        let cfg = crate::config::Config { keys: Vec::new(), services: Vec::new() };
        let cancel = tokio_util::sync::CancellationToken::new();
        let supervisor = crate::supervisor::Supervisor::new(
            std::time::Duration::from_secs(1),
            Arc::new(std::sync::atomic::AtomicBool::new(false)),
        );
        let (registry, joins) = supervisor.start(&cfg, hosts, &cancel).await.unwrap();
        assert!(joins.is_empty());
        registry
    }

    #[test]
    fn hex_decode_round_trips() {
        assert_eq!(hex_decode("deadbeef"), Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(hex_decode("abc"), None);
        assert_eq!(hex_decode(""), Some(vec![]));
    }

    #[test]
    fn authenticate_without_header_is_unauthorized() {
        let err = authenticate(&[], b"message", None).unwrap_err();
        assert!(matches!(err, ControlPlaneError::Unauthorized));
    }

    #[test]
    fn authenticate_with_malformed_header_is_unauthorized() {
        let err = authenticate(&[], b"message", Some("garbage")).unwrap_err();
        assert!(matches!(err, ControlPlaneError::Unauthorized));
    }

    #[tokio::test]
    async fn list_machines_includes_hostname() {
        let registry = empty_registry().await;
        let cp = ControlPlane::new(registry, &[], "agent-1".to_string()).unwrap();
        let listing = cp.list_machines();
        assert_eq!(listing.hostname, "agent-1");
        assert!(listing.machines.is_empty());
    }

    #[tokio::test]
    async fn list_services_unknown_filter_errors() {
        let registry = empty_registry().await;
        let cp = ControlPlane::new(registry, &[], "agent-1".to_string()).unwrap();
        let err = cp.list_services(Some("nope")).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::UnknownService(s) if s == "nope"));
    }

    #[tokio::test]
    async fn rollback_rejects_non_hex() {
        let registry = empty_registry().await;
        let cp = ControlPlane::new(registry, &[], "agent-1".to_string()).unwrap();
        let auth = AuthContext { read_only: false };
        let err = cp.rollback(auth, "svc", "not-hex!").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::InvalidHash(_)));
    }

    #[tokio::test]
    async fn write_verbs_reject_read_only_credential() {
        let registry = empty_registry().await;
        let cp = ControlPlane::new(registry, &[], "agent-1".to_string()).unwrap();
        let auth = AuthContext { read_only: true };
        let err = cp.pull(auth, "svc").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::ReadOnly));
    }
}
