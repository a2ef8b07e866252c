//! Tailscale control plane: local CLI for status, HTTP API for deletion.

use super::{ControlPlane, Peer};
use crate::options::IdentityOptions;
use async_trait::async_trait;
use serde::Deserialize;
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::collections::HashMap;
use std::time::Duration;

const API_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct StatusJson {
    #[serde(rename = "Peer", default)]
    peer: HashMap<String, PeerJson>,
}

#[derive(Debug, Deserialize)]
struct PeerJson {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "HostName", default)]
    host_name: String,
    #[serde(rename = "DNSName", default)]
    dns_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Vec<String>,
    #[serde(rename = "Online", default)]
    online: bool,
}

/// Parse `tailscale status --json` into peers, sorted by hostname.
pub fn parse_status(raw: &str) -> SovereignResult<Vec<Peer>> {
    let status: StatusJson = serde_json::from_str(raw)
        .map_err(|e| SovereignError::Identity(format!("cannot parse tailscale status: {}", e)))?;
    let mut peers: Vec<Peer> = status
        .peer
        .into_values()
        .map(|p| Peer {
            id: p.id,
            host_name: p.host_name,
            dns_name: p.dns_name.trim_end_matches('.').to_string(),
            addresses: p.tailscale_ips,
            online: p.online,
        })
        .collect();
    peers.sort_by(|a, b| a.host_name.cmp(&b.host_name));
    Ok(peers)
}

pub struct TailscalePlane {
    cli: String,
    api_base: String,
    http: reqwest::Client,
}

impl TailscalePlane {
    pub fn new(options: &IdentityOptions) -> SovereignResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| SovereignError::Identity(format!("http client: {}", e)))?;
        Ok(Self {
            cli: options.tailscale_bin.clone(),
            api_base: options.api_base.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl ControlPlane for TailscalePlane {
    async fn peers(&self) -> SovereignResult<Vec<Peer>> {
        let output = tokio::time::timeout(
            STATUS_TIMEOUT,
            tokio::process::Command::new(&self.cli)
                .args(["status", "--json"])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| SovereignError::CommandTimeout {
            command: format!("{} status --json", self.cli),
            timeout_secs: STATUS_TIMEOUT.as_secs(),
        })?
        .map_err(|e| SovereignError::Identity(format!("{} not available: {}", self.cli, e)))?;

        if !output.status.success() {
            return Err(SovereignError::Identity(format!(
                "{} status failed: {}",
                self.cli,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_status(&String::from_utf8_lossy(&output.stdout))
    }

    async fn delete_peer(&self, peer: &Peer, api_key: &str) -> SovereignResult<()> {
        let url = format!("{}/device/{}", self.api_base, peer.id);
        let resp = self
            .http
            .delete(&url)
            .basic_auth(api_key, Some(""))
            .send()
            .await
            .map_err(|e| SovereignError::Identity(format!("delete {}: {}", peer.host_name, e)))?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SovereignError::Identity(format!(
                "delete {}: HTTP {}",
                peer.host_name,
                status.as_u16()
            )))
        }
    }
}
