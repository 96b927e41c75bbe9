//! # gitfleetctl
//!
//! Command-line client for the `gitfleetd` control channel. Talks the
//! `/list/*`, `/state/*`, `/do/*` routes of §4.6/§6 over plain HTTP,
//! authenticating each request with an SSH-format private key the way
//! `ssh-keygen -Y sign` would — see [`gitfleet::control_plane::authenticate`]
//! for the matching server-side verification.
//!
//! `--at` generalizes the source tool's `@machine` targeting convention to an
//! explicit control-channel address, since clap subcommands can't parse a
//! bare `@host` token as cleanly as the original CLI's parser did.
//!
//! ```bash
//! # List every service this agent reconciles
//! gitfleetctl --at http://localhost:2222 --key ~/.ssh/id_ed25519 list services
//!
//! # Freeze one service at its current revision
//! gitfleetctl --at http://localhost:2222 --key ~/.ssh/id_ed25519 freeze grafana
//!
//! # Roll a service back to a specific commit
//! gitfleetctl --at http://localhost:2222 --key ~/.ssh/id_ed25519 rollback grafana abcd1234
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ssh_key::{HashAlg, PrivateKey};

const AUTH_NAMESPACE: &str = "gitfleet-control-plane";
const DEFAULT_AT: &str = "http://localhost:2222";

/// Talks to a running `gitfleetd` control channel.
#[derive(Debug, Parser)]
#[command(name = "gitfleetctl", about = "Control client for the gitfleet agent")]
struct Cli {
    /// Control-channel address of the target agent.
    #[arg(long, global = true, default_value = DEFAULT_AT)]
    at: String,

    /// Path to an OpenSSH private key authorized on the target agent.
    #[arg(long, global = true)]
    key: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ListKind {
    Machines,
    Services,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List machines or services known to the target agent.
    List {
        kind: ListKind,
        /// Restrict a `services` listing to one service name.
        service: Option<String>,
    },
    /// Freeze a service at its current revision.
    Freeze { service: String },
    /// Resume normal pulling for a frozen or broken service.
    Unfreeze { service: String },
    /// Pin a service to a specific commit and freeze it there.
    Rollback { service: String, hash: String },
    /// Request an immediate pull, bypassing the poll timer.
    Pull { service: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let key = PrivateKey::read_openssh_file(&cli.key)
        .with_context(|| format!("failed to read private key {}", cli.key.display()))?;
    let client = reqwest::Client::new();

    let response = match cli.command {
        Commands::List { kind: ListKind::Machines, .. } => {
            get(&client, &key, &cli.at, "/list/machine", &[]).await?
        }
        Commands::List { kind: ListKind::Services, service } => {
            let params: Vec<(&str, String)> = service.map(|s| vec![("service", s)]).unwrap_or_default();
            get(&client, &key, &cli.at, "/list/service", &params).await?
        }
        Commands::Freeze { service } => {
            post(&client, &key, &cli.at, "/state/freeze", &[("service", service)]).await?
        }
        Commands::Unfreeze { service } => {
            post(&client, &key, &cli.at, "/state/unfreeze", &[("service", service)]).await?
        }
        Commands::Rollback { service, hash } => {
            post(&client, &key, &cli.at, "/state/rollback", &[("service", service), ("hash", hash)]).await?
        }
        Commands::Pull { service } => post(&client, &key, &cli.at, "/do/pull", &[("service", service)]).await?,
    };

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        bail!("{status}: {body}");
    }
    if !body.is_empty() {
        println!("{body}");
    }
    Ok(())
}

/// Builds the `Authorization` header the same way the server verifies it:
/// a hex-encoded, PEM-armored `SshSig` over `"<METHOD> <path[?query]>"`.
fn sign(key: &PrivateKey, method: &str, path_and_query: &str) -> Result<String> {
    let message = format!("{method} {path_and_query}");
    let signature =
        key.sign(AUTH_NAMESPACE, HashAlg::Sha512, message.as_bytes()).context("failed to sign request")?;
    let pem = signature.to_pem(ssh_key::LineEnding::LF).context("failed to PEM-encode signature")?;
    Ok(hex_encode(pem.as_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn get(
    client: &reqwest::Client,
    key: &PrivateKey,
    at: &str,
    route: &str,
    params: &[(&str, String)],
) -> Result<reqwest::Response> {
    let url = reqwest::Url::parse_with_params(&format!("{at}{route}"), params)
        .with_context(|| format!("invalid control-plane URL {at}{route}"))?;
    let path_and_query = path_and_query(&url);
    let auth = sign(key, "GET", &path_and_query)?;
    client.get(url).header("Authorization", format!("Bearer {auth}")).send().await.context("request failed")
}

async fn post(
    client: &reqwest::Client,
    key: &PrivateKey,
    at: &str,
    route: &str,
    params: &[(&str, String)],
) -> Result<reqwest::Response> {
    let url = reqwest::Url::parse_with_params(&format!("{at}{route}"), params)
        .with_context(|| format!("invalid control-plane URL {at}{route}"))?;
    let path_and_query = path_and_query(&url);
    let auth = sign(key, "POST", &path_and_query)?;
    client.post(url).header("Authorization", format!("Bearer {auth}")).send().await.context("request failed")
}

fn path_and_query(url: &reqwest::Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encode_matches_known_bytes() {
        assert_eq!(hex_encode(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }

    #[test]
    fn path_and_query_without_query_string() {
        let url = reqwest::Url::parse("http://localhost:2222/list/machine").unwrap();
        assert_eq!(path_and_query(&url), "/list/machine");
    }

    #[test]
    fn path_and_query_with_query_string() {
        let url = reqwest::Url::parse("http://localhost:2222/list/service?service=grafana").unwrap();
        assert_eq!(path_and_query(&url), "/list/service?service=grafana");
    }
}
