use super::{DB_AUTH_FAILURE, Doctor, truncate_line};
use crate::network::{gateway_address, read_forwarding, show_bridge_address};
use crate::service::{ServiceDescriptor, ServiceTable};
use chrono::{DateTime, Utc};
use sovereign_shared::errors::SovereignResult;
use std::fmt;

const CONSOLE_TAIL_LINES: usize = 10;
const ERROR_PATTERN: &str = "error|fatal|failed|panic";
const ERROR_TAIL_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    fn marker(self) -> &'static str {
        match self {
            CheckStatus::Pass => "✓",
            CheckStatus::Warn => "⚠",
            CheckStatus::Fail => "✗",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

impl CheckResult {
    fn new(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Pass
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status.marker(), self.name, self.message)
    }
}

/// Everything `diagnose` learned about one guest.
#[derive(Debug, Clone)]
pub struct DiagnosisReport {
    pub service: String,
    pub display_name: String,
    pub generated_at: DateTime<Utc>,
    pub checks: Vec<CheckResult>,
    pub console_tail: Vec<String>,
    pub error_lines: Vec<String>,
    pub recommendations: Vec<String>,
}

impl DiagnosisReport {
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn healthy(&self) -> bool {
        self.checks.iter().all(CheckResult::passed)
    }
}

impl fmt::Display for DiagnosisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "=== {} ({}) at {} ===",
            self.display_name,
            self.service,
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        for check in &self.checks {
            writeln!(f, "   {}", check)?;
        }

        writeln!(f, "\nRecent console output:")?;
        if self.console_tail.is_empty() {
            writeln!(f, "   (no console.log found)")?;
        }
        for line in &self.console_tail {
            writeln!(f, "   {}", line)?;
        }

        if self.error_lines.is_empty() {
            writeln!(f, "\n✓ No obvious errors in console.log")?;
        } else {
            writeln!(f, "\n⚠ Errors in console.log:")?;
            for line in &self.error_lines {
                writeln!(f, "   {}", line)?;
            }
        }

        if !self.recommendations.is_empty() {
            writeln!(f, "\nRecommendations:")?;
            for rec in &self.recommendations {
                writeln!(f, "   -> {}", rec)?;
            }
        }
        Ok(())
    }
}

/// Device-wide health: connection, shared network and every guest.
#[derive(Debug, Clone)]
pub struct InfrastructureReport {
    pub generated_at: DateTime<Utc>,
    pub checks: Vec<CheckResult>,
}

impl InfrastructureReport {
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

impl fmt::Display for InfrastructureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "=== System diagnosis at {} ===",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        for check in &self.checks {
            writeln!(f, "   {}", check)?;
        }
        writeln!(f, "\nUse 'sovereign diagnose --<service>' for detail")
    }
}

impl Doctor<'_> {
    /// Read-only diagnosis of one guest.
    pub async fn diagnose(&self, service: &ServiceDescriptor) -> SovereignResult<DiagnosisReport> {
        let name = service.name();
        let device = self.controller.device();
        tracing::info!(service = name, "Diagnosing");

        let mut checks = vec![
            self.process_check(service).await,
            self.interface_check(service).await,
            self.bridge_check().await,
        ];

        let guest_ip = service.network().guest_ip.to_string();
        for &port in service.ports() {
            let check = format!("port {}", port);
            checks.push(if device.port_open(&guest_ip, port).await {
                CheckResult::new(check, CheckStatus::Pass, format!("{}:{} open", guest_ip, port))
            } else if service.is_optional_port(port) {
                CheckResult::new(
                    check,
                    CheckStatus::Pass,
                    format!("{}:{} not responding (may be disabled)", guest_ip, port),
                )
            } else {
                CheckResult::new(
                    check,
                    CheckStatus::Fail,
                    format!("{}:{} closed or unreachable", guest_ip, port),
                )
            });
        }

        checks.push(self.identity_check(service).await);
        checks.extend(self.https_checks(service).await);

        let console = service.console_log();
        let console_tail: Vec<String> = device
            .tail(&console, CONSOLE_TAIL_LINES)
            .await
            .unwrap_or_default()
            .iter()
            .filter(|l| !l.trim().is_empty())
            .map(|l| truncate_line(l))
            .collect();
        let raw_errors = device
            .grep_tail(&console, ERROR_PATTERN, ERROR_TAIL_LINES)
            .await
            .unwrap_or_default();

        let recommendations = recommend(service, &checks, &raw_errors);
        let error_lines = raw_errors
            .iter()
            .filter(|l| !l.trim().is_empty())
            .map(|l| truncate_line(l))
            .collect();

        Ok(DiagnosisReport {
            service: name.to_string(),
            display_name: service.display_name().to_string(),
            generated_at: Utc::now(),
            checks,
            console_tail,
            error_lines,
            recommendations,
        })
    }

    /// Diagnose the device and shared network, plus each guest's process
    /// and interface.
    pub async fn diagnose_all(&self, table: &ServiceTable) -> SovereignResult<InfrastructureReport> {
        let device = self.controller.device();
        let net = &self.controller.options().network;
        let mut checks = Vec::new();

        if !device.is_connected().await {
            checks.push(CheckResult::new("device", CheckStatus::Fail, "adb not connected"));
            return Ok(InfrastructureReport {
                generated_at: Utc::now(),
                checks,
            });
        }
        checks.push(CheckResult::new("device", CheckStatus::Pass, "adb connected"));

        let address = device
            .exec_quiet(&show_bridge_address(net))
            .await
            .unwrap_or_default();
        let gateway = gateway_address(net);
        checks.push(if address.contains(gateway) {
            CheckResult::new("bridge", CheckStatus::Pass, format!("{} configured ({})", net.bridge, gateway))
        } else {
            CheckResult::new("bridge", CheckStatus::Warn, format!("{} not configured", net.bridge))
        });

        let forwarding = device.exec_quiet(&read_forwarding()).await.unwrap_or_default();
        checks.push(if forwarding.trim() == "1" {
            CheckResult::new("ip_forward", CheckStatus::Pass, "enabled")
        } else {
            CheckResult::new("ip_forward", CheckStatus::Warn, "disabled")
        });

        for service in table.iter() {
            let mut process = self.process_check(service).await;
            process.name = format!("{} process", service.name());
            let mut interface = self.interface_check(service).await;
            interface.name = format!("{} interface", service.name());
            checks.push(process);
            checks.push(interface);
        }

        Ok(InfrastructureReport {
            generated_at: Utc::now(),
            checks,
        })
    }

    pub(super) async fn process_check(&self, service: &ServiceDescriptor) -> CheckResult {
        let device = self.controller.device();
        match self.controller.find_pid(service).await {
            Ok(Some(pid)) => {
                let details = device
                    .process_details(pid)
                    .await
                    .map(|d| format!(" [{}]", d))
                    .unwrap_or_default();
                CheckResult::new("process", CheckStatus::Pass, format!("running (PID {}){}", pid, details))
            }
            Ok(None) => CheckResult::new(
                "process",
                CheckStatus::Fail,
                format!("not running (pattern {})", service.process_pattern()),
            ),
            Err(e) => CheckResult::new("process", CheckStatus::Fail, format!("lookup failed: {}", e)),
        }
    }

    pub(super) async fn interface_check(&self, service: &ServiceDescriptor) -> CheckResult {
        let tap = &service.network().tap;
        match self.tap_state(service).await {
            None => CheckResult::new("interface", CheckStatus::Fail, format!("{} does not exist", tap)),
            Some(state) if state.no_carrier => CheckResult::new(
                "interface",
                CheckStatus::Warn,
                format!("{} has NO-CARRIER, guest not attached ({})", tap, state.describe()),
            ),
            Some(state) if state.up && state.lower_up => {
                CheckResult::new("interface", CheckStatus::Pass, format!("{} {}", tap, state.describe()))
            }
            Some(state) => CheckResult::new(
                "interface",
                CheckStatus::Warn,
                format!("{} state unclear ({})", tap, state.describe()),
            ),
        }
    }

    async fn bridge_check(&self) -> CheckResult {
        let device = self.controller.device();
        let bridge = &self.controller.options().network.bridge;
        match device.link_show(bridge).await {
            Ok(Some(_)) => {
                let members = device.bridge_members(bridge).await.unwrap_or_default();
                CheckResult::new(
                    "bridge",
                    CheckStatus::Pass,
                    format!("{} exists with {} attached interface(s)", bridge, members.len()),
                )
            }
            Ok(None) => CheckResult::new("bridge", CheckStatus::Fail, format!("{} does not exist", bridge)),
            Err(e) => CheckResult::new("bridge", CheckStatus::Fail, format!("lookup failed: {}", e)),
        }
    }

    pub(super) async fn identity_check(&self, service: &ServiceDescriptor) -> CheckResult {
        let host = service.identity_host();
        let status = self.controller.identity().query(host).await;
        let address = status.address.as_deref().unwrap_or("no address");
        let shown = status.host_name.as_deref().unwrap_or(host);
        match (status.registered, status.connected) {
            (true, true) => CheckResult::new(
                "identity",
                CheckStatus::Pass,
                format!(
                    "{} ({}) online as {}",
                    shown,
                    address,
                    status.fqdn.as_deref().unwrap_or(shown)
                ),
            ),
            (true, false) => CheckResult::new(
                "identity",
                CheckStatus::Warn,
                format!("{} ({}) offline", shown, address),
            ),
            _ => CheckResult::new(
                "identity",
                CheckStatus::Fail,
                format!("no registration matching '{}'", host),
            ),
        }
    }

    /// One result per declared HTTPS check, requested through the overlay name.
    pub(super) async fn https_checks(&self, service: &ServiceDescriptor) -> Vec<CheckResult> {
        let declared = service.https_checks();
        if declared.is_empty() {
            return Vec::new();
        }

        let status = self.controller.identity().query(service.identity_host()).await;
        let connected = status.connected;
        let fqdn = status.fqdn.filter(|_| connected);
        let timeout = self.controller.options().timing.probe_timeout();

        let mut results = Vec::with_capacity(declared.len());
        for check in declared {
            let name = format!("https {}", check.name);
            let Some(fqdn) = fqdn.as_deref() else {
                results.push(CheckResult::new(name, CheckStatus::Fail, "no online overlay FQDN"));
                continue;
            };

            let url = format!("https://{}{}", fqdn, check.path);
            results.push(match self.controller.probe().https(&url, timeout).await {
                Some(code) if check.accepts(code) => {
                    CheckResult::new(name, CheckStatus::Pass, format!("{} HTTP {}", url, code))
                }
                Some(code) => CheckResult::new(name, CheckStatus::Warn, format!("{} HTTP {}", url, code)),
                None => CheckResult::new(name, CheckStatus::Fail, format!("{} request failed", url)),
            });
        }
        results
    }
}

fn recommend(service: &ServiceDescriptor, checks: &[CheckResult], errors: &[String]) -> Vec<String> {
    let name = service.name();
    let failed = |check: &str| {
        checks
            .iter()
            .any(|c| c.name == check && !c.passed())
    };

    let mut recs = Vec::new();
    if failed("process") {
        recs.push(format!("Run: sovereign start --{}", name));
    }
    if failed("interface") {
        recs.push(format!(
            "Interface problem: sovereign stop --{0} && sovereign start --{0}",
            name
        ));
    }
    if errors.iter().any(|l| l.contains(DB_AUTH_FAILURE)) {
        recs.push("Database password mismatch: restart sql first, then this guest".to_string());
    }
    if checks
        .iter()
        .any(|c| c.name == "identity" && c.status == CheckStatus::Warn)
    {
        recs.push("Registered but offline: check 'tailscale status' inside the guest".to_string());
    }
    recs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLink, FakeReachability, TestRig, peer};
    use std::time::Duration;

    fn healthy_vault(rig: &TestRig) -> ServiceDescriptor {
        let vault = rig.service("vault");
        rig.device
            .add_process(88, "crosvm run /data/sovereign/vm/vault/rootfs.img", Duration::ZERO, None);
        rig.device.add_link("vm_bridge", FakeLink { up: true, ..Default::default() });
        rig.device.add_link(
            "vm_vault",
            FakeLink {
                up: true,
                no_carrier: false,
                master: Some("vm_bridge".into()),
            },
        );
        for port in [443, 80, 3012] {
            rig.device.open_port("192.168.100.4", port);
        }
        rig.plane.add_peer(peer("n4", "sovereign-vault", "100.64.0.4", true));
        vault
    }

    #[tokio::test]
    async fn test_diagnose_healthy_guest() {
        let rig = TestRig::with_probe(
            FakeReachability::default()
                .with_https("https://sovereign-vault.tail1234.ts.net/", 200)
                .with_https("https://sovereign-vault.tail1234.ts.net/api/config", 200),
        );
        let vault = healthy_vault(&rig);
        rig.device.log_line(&vault.console_log(), Duration::ZERO, "INIT COMPLETE");

        let report = Doctor::new(&rig.controller).diagnose(&vault).await.unwrap();
        assert!(report.healthy(), "{}", report);
        assert!(report.recommendations.is_empty());
        assert_eq!(report.console_tail, vec!["INIT COMPLETE"]);
        assert!(report.check("process").unwrap().message.contains("PID 88"));
        assert!(
            report
                .check("bridge")
                .unwrap()
                .message
                .contains("1 attached interface(s)")
        );
        assert!(report.check("https web").unwrap().passed());
        assert!(report.check("https api").unwrap().passed());

        let text = report.to_string();
        assert!(text.starts_with("=== Vaultwarden (vault) at "));
        assert!(text.contains("✓ port 3012: 192.168.100.4:3012 open"));
    }

    #[tokio::test]
    async fn test_diagnose_dead_guest_recommendations() {
        let rig = TestRig::new();
        let forge = rig.service("forge");
        rig.device.add_link(
            "vm_forge",
            FakeLink {
                up: true,
                no_carrier: true,
                master: None,
            },
        );
        rig.plane.add_peer(peer("n3", "sovereign-forge", "100.64.0.3", false));
        let console = forge.console_log();
        for i in 0..12 {
            rig.device.log_line(&console, Duration::ZERO, &format!("boot line {}", i));
        }
        rig.device.log_line(
            &console,
            Duration::ZERO,
            "FATAL: password authentication failed for user \"forgejo\"",
        );

        let report = Doctor::new(&rig.controller).diagnose(&forge).await.unwrap();
        assert_eq!(report.check("process").unwrap().status, CheckStatus::Fail);
        assert_eq!(report.check("interface").unwrap().status, CheckStatus::Warn);
        assert_eq!(report.check("identity").unwrap().status, CheckStatus::Warn);
        assert_eq!(
            report.check("https web").unwrap().message,
            "no online overlay FQDN"
        );
        assert_eq!(report.console_tail.len(), 10);
        assert_eq!(report.error_lines.len(), 1);

        assert_eq!(
            report.recommendations,
            vec![
                "Run: sovereign start --forge".to_string(),
                "Interface problem: sovereign stop --forge && sovereign start --forge".to_string(),
                "Database password mismatch: restart sql first, then this guest".to_string(),
                "Registered but offline: check 'tailscale status' inside the guest".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_diagnose_truncates_long_lines() {
        let rig = TestRig::new();
        let sql = rig.service("sql");
        rig.device
            .log_line(&sql.console_log(), Duration::ZERO, &format!("panic: {}", "x".repeat(200)));

        let report = Doctor::new(&rig.controller).diagnose(&sql).await.unwrap();
        assert_eq!(report.console_tail[0].len(), 103);
        assert_eq!(report.error_lines[0].len(), 103);
        assert!(!report.checks.iter().any(|c| c.name.starts_with("https")));
    }

    #[tokio::test]
    async fn test_diagnose_vault_api_failure() {
        let rig = TestRig::with_probe(
            FakeReachability::default()
                .with_https("https://sovereign-vault.tail1234.ts.net/", 200)
                .with_https("https://sovereign-vault.tail1234.ts.net/api/config", 502),
        );
        let vault = healthy_vault(&rig);

        let report = Doctor::new(&rig.controller).diagnose(&vault).await.unwrap();
        assert!(report.check("https web").unwrap().passed());
        let api = report.check("https api").unwrap();
        assert_eq!(api.status, CheckStatus::Warn);
        assert_eq!(api.message, "https://sovereign-vault.tail1234.ts.net/api/config HTTP 502");
        assert!(!report.healthy());
    }

    #[tokio::test]
    async fn test_diagnose_all() {
        let rig = TestRig::new();
        healthy_vault(&rig);
        rig.device.with_state(|s| {
            s.bridge_address = true;
            s.ip_forward = false;
        });

        let report = Doctor::new(&rig.controller)
            .diagnose_all(&rig.table)
            .await
            .unwrap();
        assert!(report.check("device").unwrap().passed());
        assert!(report.check("bridge").unwrap().passed());
        assert_eq!(report.check("ip_forward").unwrap().status, CheckStatus::Warn);
        assert!(report.check("vault process").unwrap().passed());
        assert!(report.check("vault interface").unwrap().passed());
        assert!(!report.check("sql process").unwrap().passed());
        assert_eq!(report.checks.len(), 3 + 2 * rig.table.len());
    }

    #[tokio::test]
    async fn test_diagnose_all_without_device() {
        let rig = TestRig::new();
        rig.device.with_state(|s| s.connected = false);

        let report = Doctor::new(&rig.controller)
            .diagnose_all(&rig.table)
            .await
            .unwrap();
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.checks[0].status, CheckStatus::Fail);
    }
}
