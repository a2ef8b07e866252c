//! Upstream reachability gate run before a dependent guest starts.
//!
//! Dependencies are checked in declaration order and the first failure ends
//! the check; later dependencies are never probed.

use crate::identity::IdentityManager;
use crate::probe::Reachability;
use crate::service::{ServiceDependency, ServiceDescriptor};
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::time::Duration;

/// Connection facts for a reachable dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyInfo {
    pub name: String,
    pub hostname: String,
    pub address: String,
    pub port: u16,
}

impl DependencyInfo {
    /// Client connection string; a postgres URL for the database port.
    pub fn connection_string(&self, user: &str, password: &str, database: &str) -> String {
        if self.port == 5432 {
            format!(
                "postgres://{}:{}@{}:{}/{}?sslmode=disable",
                user, password, self.hostname, self.port, database
            )
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

pub struct DependencyResolver<'a> {
    identity: &'a IdentityManager,
    probe: &'a dyn Reachability,
    timeout: Duration,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(identity: &'a IdentityManager, probe: &'a dyn Reachability, timeout: Duration) -> Self {
        Self {
            identity,
            probe,
            timeout,
        }
    }

    /// Verify every dependency of `service` is registered and listening.
    ///
    /// # Errors
    /// `DependencyUnavailable` for the first dependency that is not connected
    /// (naming its start command) or whose port does not answer (naming its
    /// test command).
    pub async fn check(&self, service: &ServiceDescriptor) -> SovereignResult<Vec<DependencyInfo>> {
        if service.dependencies().is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(service = service.name(), "Checking dependencies");

        let mut resolved = Vec::with_capacity(service.dependencies().len());
        for dep in service.dependencies() {
            resolved.push(self.resolve(dep).await?);
        }
        tracing::info!(service = service.name(), "All dependencies available");
        Ok(resolved)
    }

    /// Resolve and probe one dependency.
    pub async fn resolve(&self, dep: &ServiceDependency) -> SovereignResult<DependencyInfo> {
        let status = self.identity.query(&dep.hostname).await;
        let address = match (status.connected, status.address) {
            (true, Some(address)) => address,
            _ => {
                return Err(SovereignError::DependencyUnavailable {
                    dependency: dep.name.clone(),
                    reason: format!("{} not connected to the overlay network", dep.hostname),
                    next: format!("sovereign start --{}", dep.name),
                });
            }
        };

        if !self.probe.tcp(&dep.hostname, dep.port, self.timeout).await {
            return Err(SovereignError::DependencyUnavailable {
                dependency: dep.name.clone(),
                reason: format!(
                    "{} is registered ({}) but port {} is not responding",
                    dep.hostname, address, dep.port
                ),
                next: format!("sovereign test --{}", dep.name),
            });
        }

        tracing::info!(
            dependency = %dep.name,
            description = %dep.description,
            address = %address,
            port = dep.port,
            "Dependency reachable"
        );
        Ok(DependencyInfo {
            name: dep.name.clone(),
            hostname: dep.hostname.clone(),
            address,
            port: dep.port,
        })
    }
}
