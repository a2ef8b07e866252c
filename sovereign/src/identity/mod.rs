//! Stable network identity per guest.
//!
//! Dependent guests hardcode each other's overlay hostnames, so every service
//! must own exactly one registration. Peers that are offline still reserve
//! their name; a second registration would come up suffixed (`-1`) and break
//! every dependent. Registrations are removed only by explicit remove/clean.

mod credential;
mod tailscale;

pub use credential::CredentialSource;
pub use tailscale::{TailscalePlane, parse_status};

use async_trait::async_trait;
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::sync::Arc;

/// A node known to the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub host_name: String,
    /// Fully-qualified name without the trailing dot.
    pub dns_name: String,
    pub addresses: Vec<String>,
    pub online: bool,
}

impl Peer {
    pub fn ipv4(&self) -> Option<&str> {
        self.addresses
            .iter()
            .map(String::as_str)
            .find(|a| a.parse::<std::net::Ipv4Addr>().is_ok())
    }

    fn label(&self) -> String {
        format!("{} (ID: {})", self.host_name, self.id)
    }
}

/// Overlay-network control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Every known peer, online or not.
    async fn peers(&self) -> SovereignResult<Vec<Peer>>;

    async fn delete_peer(&self, peer: &Peer, api_key: &str) -> SovereignResult<()>;
}

/// Result of [`IdentityManager::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityStatus {
    /// Whether any peer, online or offline, holds the prefix.
    pub registered: bool,
    pub connected: bool,
    pub address: Option<String>,
    pub fqdn: Option<String>,
    pub host_name: Option<String>,
}

/// Outcome of [`IdentityManager::remove_registrations`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub matched: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// False when the control plane could not be queried at all.
    pub checked: bool,
}

impl RemovalReport {
    pub fn remaining(&self) -> usize {
        self.matched.len() - self.deleted.len()
    }
}

pub struct IdentityManager {
    plane: Arc<dyn ControlPlane>,
    credentials: CredentialSource,
    manual_url: String,
}

impl IdentityManager {
    pub fn new(
        plane: Arc<dyn ControlPlane>,
        credentials: CredentialSource,
        manual_url: impl Into<String>,
    ) -> Self {
        Self {
            plane,
            credentials,
            manual_url: manual_url.into(),
        }
    }

    async fn matching(&self, prefix: &str) -> SovereignResult<Vec<Peer>> {
        Ok(self
            .plane
            .peers()
            .await?
            .into_iter()
            .filter(|p| p.host_name.starts_with(prefix))
            .collect())
    }

    /// Look up the registration for `prefix`.
    ///
    /// An online match wins over offline ones. A control plane that cannot be
    /// queried yields a not-connected status and a warning.
    pub async fn query(&self, prefix: &str) -> IdentityStatus {
        let peers = match self.matching(prefix).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(prefix, error = %e, "Cannot query identity control plane");
                return IdentityStatus::default();
            }
        };

        let best = peers
            .iter()
            .find(|p| p.online)
            .or_else(|| peers.first());
        match best {
            None => IdentityStatus::default(),
            Some(peer) => IdentityStatus {
                registered: true,
                connected: peer.online,
                address: peer.ipv4().map(str::to_string),
                fqdn: (!peer.dns_name.is_empty()).then(|| peer.dns_name.clone()),
                host_name: Some(peer.host_name.clone()),
            },
        }
    }

    /// Fully-qualified overlay name for `prefix`, if registered.
    pub async fn fqdn(&self, prefix: &str) -> Option<String> {
        self.query(prefix).await.fqdn
    }

    /// Delete every registration whose hostname starts with `prefix`.
    ///
    /// # Errors
    /// * `CredentialUnavailable` - matches exist but no API key was found
    /// * `Identity` - matches exist and none could be deleted
    ///
    /// A control plane that cannot be queried degrades to a warning and an
    /// unchecked report.
    pub async fn remove_registrations(&self, prefix: &str) -> SovereignResult<RemovalReport> {
        let peers = match self.matching(prefix).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(prefix, error = %e, "Cannot check identity registrations");
                return Ok(RemovalReport::default());
            }
        };

        let mut report = RemovalReport {
            matched: peers.iter().map(|p| p.host_name.clone()).collect(),
            checked: true,
            ..Default::default()
        };
        if peers.is_empty() {
            tracing::info!(prefix, "No existing registrations");
            return Ok(report);
        }
        tracing::info!(prefix, count = peers.len(), "Found registrations to delete");

        let api_key = self
            .credentials
            .api_key()
            .ok_or_else(|| SovereignError::CredentialUnavailable {
                peers: peers.iter().map(Peer::label).collect(),
                env_var: self.credentials.env_var().to_string(),
                manual_url: self.manual_url.clone(),
            })?;

        for peer in &peers {
            match self.plane.delete_peer(peer, &api_key).await {
                Ok(()) => {
                    tracing::info!(host = %peer.host_name, id = %peer.id, "Deleted registration");
                    report.deleted.push(peer.host_name.clone());
                }
                Err(e) => {
                    tracing::warn!(host = %peer.host_name, error = %e, "Failed to delete registration");
                    report.failed.push((peer.host_name.clone(), e.to_string()));
                }
            }
        }

        if report.deleted.is_empty() {
            return Err(SovereignError::Identity(format!(
                "could not delete any of {} registration(s) for {}",
                report.matched.len(),
                prefix
            )));
        }
        if report.remaining() > 0 {
            tracing::warn!(
                prefix,
                deleted = report.deleted.len(),
                total = report.matched.len(),
                "Some registrations remain"
            );
        }
        Ok(report)
    }
}
