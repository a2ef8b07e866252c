//! Host-side reachability checks against guests over the overlay network.

use async_trait::async_trait;
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::time::Duration;

#[async_trait]
pub trait Reachability: Send + Sync {
    /// Whether a TCP connection to `host:port` succeeds within `timeout`.
    async fn tcp(&self, host: &str, port: u16, timeout: Duration) -> bool;

    /// HTTP status of a GET to `url`, `None` when unreachable.
    async fn https(&self, url: &str, timeout: Duration) -> Option<u16>;
}

pub struct NetProber {
    http: reqwest::Client,
}

impl NetProber {
    pub fn new() -> SovereignResult<Self> {
        // Guests serve self-signed certificates on their overlay names.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| SovereignError::Internal(format!("http client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Reachability for NetProber {
    async fn tcp(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let connect = tokio::net::TcpStream::connect((host, port));
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(host, port, error = %e, "TCP probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(host, port, "TCP probe timed out");
                false
            }
        }
    }

    async fn https(&self, url: &str, timeout: Duration) -> Option<u16> {
        match self.http.get(url).timeout(timeout).send().await {
            Ok(resp) => Some(resp.status().as_u16()),
            Err(e) => {
                tracing::debug!(url, error = %e, "HTTPS probe failed");
                None
            }
        }
    }
}
