use crate::boot::LogRule;
use crate::device::self_match_safe;
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placement of a guest on the shared virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNetwork {
    /// Host-side TAP interface created by the VMM.
    pub tap: String,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    /// Shared subnet in CIDR form, e.g. `192.168.100.0/24`.
    pub subnet: String,
}

/// Where the guest kernel comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSource {
    /// `Image` inside the service's own build output.
    Bundled,
    /// A kernel built for another service, relative to the working directory.
    Shared(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub image_tag: String,
    pub kernel: KernelSource,
    pub needs_secrets: bool,
}

/// An upstream service that must be reachable before start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDependency {
    pub name: String,
    pub hostname: String,
    pub ip: Option<Ipv4Addr>,
    pub port: u16,
    pub description: String,
}

impl ServiceDependency {
    /// The PostgreSQL guest, shared by every service that stores data in it.
    pub fn postgres() -> Self {
        Self {
            name: "sql".to_string(),
            hostname: "sovereign-sql".to_string(),
            ip: Some(Ipv4Addr::new(192, 168, 100, 2)),
            port: 5432,
            description: "PostgreSQL database".to_string(),
        }
    }
}

/// An HTTPS request against the guest's overlay FQDN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpsCheck {
    pub name: String,
    pub path: String,
    /// Status codes counted as healthy.
    pub accepted: Vec<u16>,
}

impl HttpsCheck {
    pub fn accepts(&self, status: u16) -> bool {
        self.accepted.contains(&status)
    }
}

/// Immutable description of one guest service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    name: String,
    display_name: String,
    network: GuestNetwork,
    identity_host: String,
    local_path: PathBuf,
    device_path: String,
    ports: Vec<u16>,
    optional_ports: Vec<u16>,
    ready_marker: String,
    start_timeout: Duration,
    build: BuildOptions,
    dependencies: Vec<ServiceDependency>,
    process_pattern: String,
    log_rules: Vec<LogRule>,
    https_checks: Vec<HttpsCheck>,
    policy_routing: bool,
}

impl ServiceDescriptor {
    pub fn builder(name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn network(&self) -> &GuestNetwork {
        &self.network
    }

    /// Hostname prefix registered with the identity provider.
    pub fn identity_host(&self) -> &str {
        &self.identity_host
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Every declared guest port, optional ones included.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// A closed optional port is reported but never fails a check.
    pub fn is_optional_port(&self, port: u16) -> bool {
        self.optional_ports.contains(&port)
    }

    pub fn ready_marker(&self) -> &str {
        &self.ready_marker
    }

    pub fn start_timeout(&self) -> Duration {
        self.start_timeout
    }

    pub fn build(&self) -> &BuildOptions {
        &self.build
    }

    pub fn dependencies(&self) -> &[ServiceDependency] {
        &self.dependencies
    }

    /// Process query pattern, already in self-match-safe form.
    pub fn process_pattern(&self) -> &str {
        &self.process_pattern
    }

    /// Extra console rules checked ahead of the built-in ones.
    pub fn log_rules(&self) -> &[LogRule] {
        &self.log_rules
    }

    /// Requests made over HTTPS on the guest's identity FQDN.
    pub fn https_checks(&self) -> &[HttpsCheck] {
        &self.https_checks
    }

    /// Whether stop must also drop the policy-routing rules.
    pub fn policy_routing(&self) -> bool {
        self.policy_routing
    }

    pub fn console_log(&self) -> String {
        format!("{}/console.log", self.device_path)
    }

    pub fn vm_socket(&self) -> String {
        format!("{}/vm.sock", self.device_path)
    }

    pub fn pid_file(&self) -> String {
        format!("{}/vm.pid", self.device_path)
    }

    /// Per-service start script, used when the supervisor daemon is absent.
    pub fn start_script(&self) -> String {
        format!("{}/start.sh", self.device_path)
    }

    /// Local artifact for the kernel, honouring a shared kernel.
    pub fn local_kernel(&self) -> PathBuf {
        match &self.build.kernel {
            KernelSource::Bundled => self.local_path.join("Image"),
            KernelSource::Shared(path) => path.clone(),
        }
    }
}

/// Builder for [`ServiceDescriptor`]; `build` validates the result.
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    name: String,
    display_name: Option<String>,
    tap: Option<String>,
    host_ip: Ipv4Addr,
    guest_ip: Option<Ipv4Addr>,
    subnet: String,
    identity_host: Option<String>,
    local_path: Option<PathBuf>,
    device_path: Option<String>,
    ports: Vec<u16>,
    optional_ports: Vec<u16>,
    ready_marker: String,
    start_timeout: Duration,
    image_tag: Option<String>,
    kernel: KernelSource,
    needs_secrets: bool,
    dependencies: Vec<ServiceDependency>,
    process_pattern: Option<String>,
    log_rules: Vec<LogRule>,
    https_checks: Vec<HttpsCheck>,
    policy_routing: bool,
}

impl DescriptorBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            display_name: None,
            tap: None,
            host_ip: Ipv4Addr::new(192, 168, 100, 1),
            guest_ip: None,
            subnet: "192.168.100.0/24".to_string(),
            identity_host: None,
            local_path: None,
            device_path: None,
            ports: Vec::new(),
            optional_ports: Vec::new(),
            ready_marker: crate::boot::FALLBACK_READY_MARKER.to_string(),
            start_timeout: Duration::from_secs(120),
            image_tag: None,
            kernel: KernelSource::Bundled,
            needs_secrets: false,
            dependencies: Vec::new(),
            process_pattern: None,
            log_rules: Vec::new(),
            https_checks: Vec::new(),
            policy_routing: false,
        }
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn tap(mut self, tap: impl Into<String>) -> Self {
        self.tap = Some(tap.into());
        self
    }

    pub fn host_ip(mut self, ip: Ipv4Addr) -> Self {
        self.host_ip = ip;
        self
    }

    pub fn guest_ip(mut self, ip: Ipv4Addr) -> Self {
        self.guest_ip = Some(ip);
        self
    }

    pub fn subnet(mut self, subnet: impl Into<String>) -> Self {
        self.subnet = subnet.into();
        self
    }

    pub fn identity_host(mut self, host: impl Into<String>) -> Self {
        self.identity_host = Some(host.into());
        self
    }

    pub fn local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn device_path(mut self, path: impl Into<String>) -> Self {
        self.device_path = Some(path.into());
        self
    }

    pub fn ports(mut self, ports: &[u16]) -> Self {
        self.ports = ports.to_vec();
        self
    }

    /// Declare a port the guest may legitimately leave closed.
    pub fn optional_port(mut self, port: u16) -> Self {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
        self.optional_ports.push(port);
        self
    }

    pub fn ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.ready_marker = marker.into();
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn image_tag(mut self, tag: impl Into<String>) -> Self {
        self.image_tag = Some(tag.into());
        self
    }

    pub fn shared_kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel = KernelSource::Shared(path.into());
        self
    }

    pub fn needs_secrets(mut self, needs: bool) -> Self {
        self.needs_secrets = needs;
        self
    }

    pub fn depends_on(mut self, dependency: ServiceDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn process_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.process_pattern = Some(pattern.into());
        self
    }

    pub fn log_rule(mut self, rule: LogRule) -> Self {
        self.log_rules.push(rule);
        self
    }

    pub fn https_check(
        mut self,
        name: impl Into<String>,
        path: impl Into<String>,
        accepted: &[u16],
    ) -> Self {
        self.https_checks.push(HttpsCheck {
            name: name.into(),
            path: path.into(),
            accepted: accepted.to_vec(),
        });
        self
    }

    pub fn policy_routing(mut self, enabled: bool) -> Self {
        self.policy_routing = enabled;
        self
    }

    /// Validate and freeze the descriptor.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when a required field is missing, the name is
    /// not a plain identifier, or the guest IP lies outside the subnet.
    pub fn build(self) -> SovereignResult<ServiceDescriptor> {
        let name = self.name;
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SovereignError::InvalidArgument(format!(
                "invalid service name: {:?}",
                name
            )));
        }

        let missing =
            |field: &str| SovereignError::InvalidArgument(format!("{}: {} is required", name, field));

        let guest_ip = self.guest_ip.ok_or_else(|| missing("guest_ip"))?;
        let tap = self.tap.ok_or_else(|| missing("tap"))?;
        let device_path = self.device_path.ok_or_else(|| missing("device_path"))?;
        let local_path = self.local_path.ok_or_else(|| missing("local_path"))?;
        let pattern = self.process_pattern.ok_or_else(|| missing("process_pattern"))?;
        if pattern.is_empty() {
            return Err(missing("process_pattern"));
        }

        if !in_subnet(guest_ip, &self.subnet)? {
            return Err(SovereignError::InvalidArgument(format!(
                "{}: guest ip {} is outside {}",
                name, guest_ip, self.subnet
            )));
        }
        if guest_ip == self.host_ip {
            return Err(SovereignError::InvalidArgument(format!(
                "{}: guest ip {} collides with the host address",
                name, guest_ip
            )));
        }

        if let Some(check) = self.https_checks.iter().find(|c| c.accepted.is_empty()) {
            return Err(SovereignError::InvalidArgument(format!(
                "{}: https check '{}' accepts no status code",
                name, check.name
            )));
        }

        let device_path = device_path.trim_end_matches('/').to_string();

        Ok(ServiceDescriptor {
            display_name: self.display_name.unwrap_or_else(|| name.clone()),
            identity_host: self
                .identity_host
                .unwrap_or_else(|| format!("sovereign-{}", name)),
            network: GuestNetwork {
                tap,
                host_ip: self.host_ip,
                guest_ip,
                subnet: self.subnet,
            },
            local_path,
            device_path,
            ports: self.ports,
            optional_ports: self.optional_ports,
            ready_marker: self.ready_marker,
            start_timeout: self.start_timeout,
            build: BuildOptions {
                image_tag: self
                    .image_tag
                    .unwrap_or_else(|| format!("sovereign-{}", name)),
                kernel: self.kernel,
                needs_secrets: self.needs_secrets,
            },
            dependencies: self.dependencies,
            process_pattern: self_match_safe(&pattern),
            log_rules: self.log_rules,
            https_checks: self.https_checks,
            policy_routing: self.policy_routing,
            name,
        })
    }
}

fn in_subnet(ip: Ipv4Addr, cidr: &str) -> SovereignResult<bool> {
    let invalid = || SovereignError::InvalidArgument(format!("invalid subnet: {}", cidr));
    let (base, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let base: Ipv4Addr = base.parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ok(u32::from(ip) & mask == u32::from(base) & mask)
}
