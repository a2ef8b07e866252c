use super::descriptor::{ServiceDependency, ServiceDescriptor};
use crate::options::SovereignOptions;
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Ordered lookup table of service descriptors.
#[derive(Debug, Clone)]
pub struct ServiceTable {
    services: Vec<ServiceDescriptor>,
}

impl ServiceTable {
    /// Build a table, rejecting duplicate names and duplicate guest IPs.
    pub fn new(services: Vec<ServiceDescriptor>) -> SovereignResult<Self> {
        let mut names = HashSet::new();
        let mut ips = HashSet::new();
        for service in &services {
            if !names.insert(service.name().to_string()) {
                return Err(SovereignError::InvalidArgument(format!(
                    "duplicate service name: {}",
                    service.name()
                )));
            }
            if !ips.insert(service.network().guest_ip) {
                return Err(SovereignError::InvalidArgument(format!(
                    "{}: guest ip {} already assigned",
                    service.name(),
                    service.network().guest_ip
                )));
            }
        }
        Ok(Self { services })
    }

    /// The stock services: PostgreSQL, Forgejo and Vaultwarden.
    pub fn builtin(options: &SovereignOptions) -> SovereignResult<Self> {
        let root = options.device.root.trim_end_matches('/');
        let subnet = options.network.subnet.clone();
        let host_ip = gateway_ip(&options.network.gateway_cidr)?;

        let sql = ServiceDescriptor::builder("sql")
            .display_name("PostgreSQL")
            .tap("vm_sql")
            .host_ip(host_ip)
            .guest_ip(Ipv4Addr::new(192, 168, 100, 2))
            .subnet(subnet.clone())
            .identity_host("sovereign-sql")
            .local_path("vm/sql")
            .device_path(format!("{}/vm/sql", root))
            .ports(&[5432])
            .ready_marker("PostgreSQL started")
            .start_timeout(Duration::from_secs(90))
            .image_tag("sovereign-sql")
            .needs_secrets(true)
            .process_pattern("crosvm.*sql")
            .policy_routing(true)
            .build()?;

        let forge = ServiceDescriptor::builder("forge")
            .display_name("Forgejo")
            .tap("vm_forge")
            .host_ip(host_ip)
            .guest_ip(Ipv4Addr::new(192, 168, 100, 3))
            .subnet(subnet.clone())
            .identity_host("sovereign-forge")
            .local_path("vm/forgejo")
            .device_path(format!("{}/vm/forgejo", root))
            .ports(&[3000])
            .optional_port(22)
            .start_timeout(Duration::from_secs(120))
            .image_tag("sovereign-forge")
            .shared_kernel("vm/sql/Image")
            .depends_on(ServiceDependency::postgres())
            .process_pattern("crosvm.*vm/forgejo/")
            .https_check("web", "/", &[200, 302, 303])
            .build()?;

        let vault = ServiceDescriptor::builder("vault")
            .display_name("Vaultwarden")
            .tap("vm_vault")
            .host_ip(host_ip)
            .guest_ip(Ipv4Addr::new(192, 168, 100, 4))
            .subnet(subnet)
            .identity_host("sovereign-vault")
            .local_path("vm/vault")
            .device_path(format!("{}/vm/vault", root))
            .ports(&[443, 80, 3012])
            .start_timeout(Duration::from_secs(120))
            .image_tag("sovereign-vault")
            .shared_kernel("vm/sql/Image")
            .needs_secrets(true)
            .depends_on(ServiceDependency::postgres())
            .process_pattern("crosvm.*vm/vault/")
            .https_check("web", "/", &[200])
            .https_check("api", "/api/config", &[200])
            .build()?;

        Self::new(vec![sql, forge, vault])
    }

    /// Look up a service by name.
    ///
    /// # Errors
    /// Returns `InvalidArgument` listing the known names when absent.
    pub fn get(&self, name: &str) -> SovereignResult<&ServiceDescriptor> {
        self.services
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| {
                SovereignError::InvalidArgument(format!(
                    "unknown service '{}' (known: {})",
                    name,
                    self.names().join(", ")
                ))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn gateway_ip(cidr: &str) -> SovereignResult<Ipv4Addr> {
    let addr = cidr.split('/').next().unwrap_or(cidr);
    addr.parse().map_err(|_| {
        SovereignError::Config(format!("invalid bridge gateway address: {}", cidr))
    })
}
