//! Remediation steps.
//!
//! Every step inspects first and acts only on a detected problem, so a
//! second run against a healthy guest changes nothing.

use super::{DB_AUTH_FAILURE, Doctor};
use crate::lifecycle::{StartOptions, StartOutcome};
use crate::network::{
    LinkState, assign_bridge_address, attach_to_bridge, create_bridge, enable_forwarding,
    ensure_main_route_rule, ensure_nat_and_forwarding, gateway_address, link_up, read_forwarding,
    show_bridge_address,
};
use crate::service::ServiceDescriptor;
use sovereign_shared::errors::SovereignResult;
use std::fmt;

const PHANTOM_LIMIT: &str = "2147483647";
const PHANTOM_GET: &str = "device_config get activity_manager max_phantom_processes 2>/dev/null";
const PHANTOM_DISABLE: [&str; 3] = [
    "device_config set_sync_disabled_for_tests persistent",
    "device_config put activity_manager max_phantom_processes 2147483647",
    "settings put global settings_enable_monitor_phantom_procs false",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixResult {
    pub issue: &'static str,
    /// A repair was applied and its postcondition now holds.
    pub fixed: bool,
    /// The postcondition holds after this step.
    pub ok: bool,
    pub message: String,
}

impl FixResult {
    fn healthy(issue: &'static str, message: impl Into<String>) -> Self {
        Self {
            issue,
            fixed: false,
            ok: true,
            message: message.into(),
        }
    }

    fn repaired(issue: &'static str, message: impl Into<String>) -> Self {
        Self {
            issue,
            fixed: true,
            ok: true,
            message: message.into(),
        }
    }

    fn unresolved(issue: &'static str, message: impl Into<String>) -> Self {
        Self {
            issue,
            fixed: false,
            ok: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for FixResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match (self.fixed, self.ok) {
            (true, _) => "✓ fixed",
            (false, true) => "✓",
            (false, false) => "⚠",
        };
        write!(f, "{} {}: {}", marker, self.issue, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct FixReport {
    /// Service name, or `infrastructure`.
    pub target: String,
    pub results: Vec<FixResult>,
}

impl FixReport {
    pub fn fixed_count(&self) -> usize {
        self.results.iter().filter(|r| r.fixed).count()
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn result(&self, issue: &str) -> Option<&FixResult> {
        self.results.iter().find(|r| r.issue == issue)
    }

    /// Issues still failing after the run.
    pub fn outstanding(&self) -> Vec<&FixResult> {
        self.results.iter().filter(|r| !r.ok).collect()
    }
}

impl fmt::Display for FixReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Auto-fix: {} ===", self.target)?;
        for result in &self.results {
            writeln!(f, "   {}", result)?;
        }
        match self.fixed_count() {
            0 => writeln!(f, "\nNo issues needed fixing ({} checked)", self.total()),
            n => writeln!(f, "\nFixed {} of {} checked issue(s)", n, self.total()),
        }
    }
}

impl Doctor<'_> {
    /// Detect and repair common problems for one guest.
    ///
    /// # Errors
    /// `Device` when no device is connected. Individual step failures are
    /// reported in the returned [`FixReport`].
    pub async fn fix(&self, service: &ServiceDescriptor) -> SovereignResult<FixReport> {
        self.ensure_connected().await?;
        tracing::info!(service = service.name(), "Auto-fixing");

        let mut results = vec![
            self.fix_bridge().await,
            self.fix_forwarding().await,
            self.fix_process_killers().await,
            self.fix_stale_state(service).await,
            self.fix_vm_process(service).await,
            self.fix_interface(service).await,
        ];
        if !service.dependencies().is_empty() {
            results.push(self.check_dependencies(service).await);
        }
        results.push(self.check_identity(service).await);

        let report = FixReport {
            target: service.name().to_string(),
            results,
        };
        tracing::info!(
            service = service.name(),
            fixed = report.fixed_count(),
            total = report.total(),
            outstanding = report.outstanding().len(),
            "Auto-fix complete"
        );
        Ok(report)
    }

    /// Repair the shared network and device settings all guests rely on.
    pub async fn fix_infrastructure(&self) -> SovereignResult<FixReport> {
        self.ensure_connected().await?;
        let device = self.controller.device();
        let net = &self.controller.options().network;
        tracing::info!("Auto-fixing infrastructure");

        let mut results = vec![
            self.fix_bridge().await,
            self.fix_forwarding().await,
            self.fix_process_killers().await,
        ];

        results.push(match device.exec_quiet(&ensure_main_route_rule()).await {
            Some(_) => FixResult::healthy("routing", "main table rule at pref 1"),
            None => FixResult::unresolved("routing", "could not install main table rule"),
        });

        let mut failed = Vec::new();
        for command in ensure_nat_and_forwarding(net) {
            if let Err(e) = device.exec(&command, device.command_timeout()).await {
                tracing::warn!(command = %command, error = %e, "Firewall rule failed");
                failed.push(e.to_string());
            }
        }
        results.push(if failed.is_empty() {
            FixResult::healthy(
                "firewall",
                format!("NAT {} via {} and bridge forwarding in place", net.subnet, net.uplink),
            )
        } else {
            FixResult::unresolved("firewall", failed.join("; "))
        });

        Ok(FixReport {
            target: "infrastructure".to_string(),
            results,
        })
    }

    async fn bridge_addressed(&self) -> bool {
        let net = &self.controller.options().network;
        self.controller
            .device()
            .exec_quiet(&show_bridge_address(net))
            .await
            .is_some_and(|out| out.contains(gateway_address(net)))
    }

    async fn bridge_state(&self) -> Option<LinkState> {
        let bridge = &self.controller.options().network.bridge;
        let out = self.controller.device().link_show(bridge).await.ok().flatten()?;
        LinkState::parse(&out)
    }

    async fn fix_bridge(&self) -> FixResult {
        let device = self.controller.device();
        let net = &self.controller.options().network;
        let mut actions = Vec::new();

        if self.bridge_state().await.is_none() {
            device.exec_quiet(&create_bridge(net)).await;
            actions.push("created");
        }
        if !self.bridge_addressed().await {
            device.exec_quiet(&assign_bridge_address(net)).await;
            actions.push("assigned gateway address");
        }
        if !self.bridge_state().await.is_some_and(|s| s.up) {
            device.exec_quiet(&link_up(&net.bridge)).await;
            actions.push("brought up");
        }

        if actions.is_empty() {
            return FixResult::healthy("bridge", format!("{} OK", net.bridge));
        }
        let up = self.bridge_state().await.is_some_and(|s| s.up);
        if up && self.bridge_addressed().await {
            FixResult::repaired(
                "bridge",
                format!("{} {} ({})", net.bridge, actions.join(", "), net.gateway_cidr),
            )
        } else {
            FixResult::unresolved("bridge", format!("{} still unhealthy after repair", net.bridge))
        }
    }

    async fn forwarding_enabled(&self) -> bool {
        self.controller
            .device()
            .exec_quiet(&read_forwarding())
            .await
            .is_some_and(|out| out.trim() == "1")
    }

    async fn fix_forwarding(&self) -> FixResult {
        if self.forwarding_enabled().await {
            return FixResult::healthy("forwarding", "IP forwarding enabled");
        }
        self.controller.device().exec_quiet(&enable_forwarding()).await;
        if self.forwarding_enabled().await {
            FixResult::repaired("forwarding", "enabled IP forwarding")
        } else {
            FixResult::unresolved("forwarding", "IP forwarding still disabled")
        }
    }

    async fn phantom_killer_disabled(&self) -> bool {
        self.controller
            .device()
            .exec_quiet(PHANTOM_GET)
            .await
            .is_some_and(|out| out.trim() == PHANTOM_LIMIT)
    }

    async fn fix_process_killers(&self) -> FixResult {
        if self.phantom_killer_disabled().await {
            return FixResult::healthy("process_killers", "phantom process killer already disabled");
        }
        for command in PHANTOM_DISABLE {
            self.controller.device().exec_quiet(command).await;
        }
        if self.phantom_killer_disabled().await {
            FixResult::repaired("process_killers", "disabled phantom process killer")
        } else {
            FixResult::unresolved("process_killers", "phantom process limit unchanged")
        }
    }

    async fn fix_stale_state(&self, service: &ServiceDescriptor) -> FixResult {
        match self.controller.find_pid(service).await {
            Ok(Some(_)) => return FixResult::healthy("stale_state", "guest running, state kept"),
            Ok(None) => {}
            Err(e) => return FixResult::unresolved("stale_state", format!("process lookup failed: {}", e)),
        }

        let device = self.controller.device();
        let files = [service.vm_socket(), service.pid_file()];
        let mut stale = Vec::new();
        for file in &files {
            if device.file_exists(file).await.unwrap_or(false) {
                stale.push(file.as_str());
            }
        }
        if stale.is_empty() {
            return FixResult::healthy("stale_state", "no stale state");
        }

        device.remove_files(&stale).await;
        for file in &stale {
            if device.file_exists(file).await.unwrap_or(true) {
                return FixResult::unresolved("stale_state", format!("could not remove {}", file));
            }
        }
        FixResult::repaired("stale_state", format!("removed {}", stale.join(", ")))
    }

    async fn fix_vm_process(&self, service: &ServiceDescriptor) -> FixResult {
        let name = service.name();
        match self.controller.find_pid(service).await {
            Ok(Some(pid)) => return FixResult::healthy("vm_process", format!("running (PID {})", pid)),
            Ok(None) => {}
            Err(e) => return FixResult::unresolved("vm_process", format!("process lookup failed: {}", e)),
        }

        let auth_failures = self
            .controller
            .device()
            .grep_tail(&service.console_log(), DB_AUTH_FAILURE, 1)
            .await
            .unwrap_or_default();
        if !auth_failures.is_empty() {
            return FixResult::unresolved(
                "vm_process",
                "guest died on database password authentication; restart sql first, then this guest",
            );
        }

        tracing::info!(service = name, "Guest not running, restarting");
        match self.controller.start(service, StartOptions::default()).await {
            Ok(StartOutcome::Started { pid, .. }) => FixResult::repaired(
                "vm_process",
                match pid {
                    Some(pid) => format!("started (PID {})", pid),
                    None => "started".to_string(),
                },
            ),
            Ok(StartOutcome::AlreadyRunning { pid }) => {
                FixResult::healthy("vm_process", format!("running (PID {})", pid))
            }
            Err(e) => {
                let next = e
                    .next_command()
                    .unwrap_or_else(|| format!("sovereign diagnose --{}", name));
                FixResult::unresolved("vm_process", format!("restart failed: {} (next: {})", e, next))
            }
        }
    }

    async fn fix_interface(&self, service: &ServiceDescriptor) -> FixResult {
        let device = self.controller.device();
        let net = &self.controller.options().network;
        let tap = &service.network().tap;

        let Some(state) = self.tap_state(service).await else {
            return FixResult::unresolved("interface", format!("{} missing; created when the guest starts", tap));
        };
        if state.no_carrier {
            return FixResult::unresolved("interface", format!("{} has NO-CARRIER, guest not attached", tap));
        }

        let mut actions = Vec::new();
        if !state.up {
            device.exec_quiet(&link_up(tap)).await;
            actions.push("brought up");
        }
        if state.master.as_deref() != Some(net.bridge.as_str()) {
            device.exec_quiet(&attach_to_bridge(tap, net)).await;
            actions.push("attached to bridge");
        }
        if actions.is_empty() {
            return FixResult::healthy("interface", format!("{} OK", tap));
        }

        match self.tap_state(service).await {
            Some(after) if after.up && after.master.as_deref() == Some(net.bridge.as_str()) => {
                FixResult::repaired("interface", format!("{} {}", tap, actions.join(", ")))
            }
            _ => FixResult::unresolved("interface", format!("{} still unhealthy after repair", tap)),
        }
    }

    /// Report-only: dependencies are never started implicitly.
    async fn check_dependencies(&self, service: &ServiceDescriptor) -> FixResult {
        let device = self.controller.device();
        let resolver = self.controller.resolver();
        for dep in service.dependencies() {
            let reachable = match dep.ip {
                Some(ip) => device.port_open(&ip.to_string(), dep.port).await,
                None => resolver.resolve(dep).await.is_ok(),
            };
            if !reachable {
                let at = dep
                    .ip
                    .map(|ip| format!("{}:{}", ip, dep.port))
                    .unwrap_or_else(|| format!("{}:{}", dep.hostname, dep.port));
                return FixResult::unresolved(
                    "dependencies",
                    format!("{} not reachable at {}; run 'sovereign start --{}'", dep.name, at, dep.name),
                );
            }
        }
        FixResult::healthy("dependencies", "dependencies reachable")
    }

    /// Report-only: registrations are only changed by remove or clean.
    async fn check_identity(&self, service: &ServiceDescriptor) -> FixResult {
        let status = self
            .controller
            .identity()
            .query(service.identity_host())
            .await;
        match (status.registered, status.connected) {
            (true, true) => FixResult::healthy("identity", "connected"),
            (true, false) => FixResult::unresolved("identity", "registered but offline; restart the guest"),
            _ => FixResult::unresolved(
                "identity",
                "not registered; check the auth key in the credential file",
            ),
        }
    }
}
