use super::Doctor;
use crate::service::ServiceDescriptor;
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "✓ PASS" } else { "✗ FAIL" };
        if self.message.is_empty() {
            write!(f, "{}: {}", self.name, verdict)
        } else {
            write!(f, "{}: {} ({})", self.name, verdict, self.message)
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestReport {
    pub service: String,
    pub results: Vec<TestResult>,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.name.clone())
            .collect()
    }

    /// `TestsFailed` unless every result passed.
    pub fn into_result(self) -> SovereignResult<Self> {
        if self.passed() {
            Ok(self)
        } else {
            Err(SovereignError::TestsFailed {
                service: self.service.clone(),
                failed: self.failed_names(),
            })
        }
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Testing {} ===", self.service)?;
        for (i, result) in self.results.iter().enumerate() {
            writeln!(f, "{}. {}", i + 1, result)?;
        }
        if self.passed() {
            writeln!(f, "\n=== ALL TESTS PASSED ===")
        } else {
            writeln!(f, "\n=== {} TEST(S) FAILED ===", self.failed_names().len())
        }
    }
}

fn result(name: impl Into<String>, passed: bool, message: impl Into<String>) -> TestResult {
    TestResult {
        name: name.into(),
        passed,
        message: message.into(),
    }
}

impl Doctor<'_> {
    /// Run every post-start test for `service` and collect the outcomes.
    pub async fn verify(&self, service: &ServiceDescriptor) -> TestReport {
        let device = self.controller.device();
        let mut results = Vec::new();

        results.push(match self.controller.find_pid(service).await {
            Ok(Some(pid)) => result("process running", true, format!("PID {}", pid)),
            Ok(None) => result("process running", false, "guest not running"),
            Err(e) => result("process running", false, e.to_string()),
        });

        let tap = &service.network().tap;
        results.push(match self.tap_state(service).await {
            Some(state) if state.is_healthy() => {
                result(format!("interface {}", tap), true, state.describe())
            }
            Some(state) => result(format!("interface {}", tap), false, state.describe()),
            None => result(format!("interface {}", tap), false, "missing"),
        });

        let status = self
            .controller
            .identity()
            .query(service.identity_host())
            .await;
        results.push(if status.connected {
            result(
                "identity connected",
                true,
                format!(
                    "{} as {}",
                    status.address.as_deref().unwrap_or("?"),
                    status.host_name.as_deref().unwrap_or(service.identity_host())
                ),
            )
        } else {
            result(
                "identity connected",
                false,
                format!("no active {}* registration", service.identity_host()),
            )
        });

        let guest_ip = service.network().guest_ip.to_string();
        for &port in service.ports() {
            let open = device.port_open(&guest_ip, port).await;
            let optional = service.is_optional_port(port);
            results.push(result(
                format!("port {}", port),
                open || optional,
                match (open, optional) {
                    (true, _) => "",
                    (false, true) => "not responding (may be disabled)",
                    (false, false) => "closed",
                },
            ));
        }

        for check in self.https_checks(service).await {
            let passed = check.passed();
            results.push(result(check.name, passed, check.message));
        }

        let report = TestReport {
            service: service.name().to_string(),
            results,
        };
        for r in &report.results {
            if r.passed {
                tracing::info!(service = service.name(), test = %r.name, "{}", r);
            } else {
                tracing::warn!(service = service.name(), test = %r.name, "{}", r);
            }
        }
        report
    }

    /// Like [`Doctor::verify`], failing when any test fails.
    ///
    /// # Errors
    /// `TestsFailed` naming each failing test.
    pub async fn run_tests(&self, service: &ServiceDescriptor) -> SovereignResult<TestReport> {
        self.verify(service).await.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLink, FakeReachability, TestRig, peer};
    use std::time::Duration;

    #[tokio::test]
    async fn test_all_pass() {
        let rig = TestRig::with_probe(
            FakeReachability::default().with_https("https://sovereign-forge.tail1234.ts.net/", 200),
        );
        let forge = running_forge(&rig);
        rig.device.open_port("192.168.100.3", 22);

        let report = Doctor::new(&rig.controller).run_tests(&forge).await.unwrap();
        let names: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "process running",
                "interface vm_forge",
                "identity connected",
                "port 3000",
                "port 22",
                "https web"
            ]
        );
        assert!(report.to_string().contains("ALL TESTS PASSED"));
    }

    fn running_forge(rig: &TestRig) -> ServiceDescriptor {
        let forge = rig.service("forge");
        rig.device
            .add_process(9, "crosvm run /data/sovereign/vm/forgejo/rootfs.img", Duration::ZERO, None);
        rig.device.add_link(
            "vm_forge",
            FakeLink {
                up: true,
                no_carrier: false,
                master: Some("vm_bridge".into()),
            },
        );
        rig.device.open_port("192.168.100.3", 3000);
        rig.plane.add_peer(peer("n3", "sovereign-forge", "100.64.0.3", true));
        forge
    }

    #[tokio::test]
    async fn test_forge_redirect_and_closed_ssh_pass() {
        let rig = TestRig::with_probe(
            FakeReachability::default().with_https("https://sovereign-forge.tail1234.ts.net/", 302),
        );
        let forge = running_forge(&rig);

        let report = Doctor::new(&rig.controller).run_tests(&forge).await.unwrap();
        let ssh = report.results.iter().find(|r| r.name == "port 22").unwrap();
        assert!(ssh.passed);
        assert_eq!(ssh.message, "not responding (may be disabled)");
        let web = report.results.iter().find(|r| r.name == "https web").unwrap();
        assert!(web.message.ends_with("HTTP 302"));
    }

    #[tokio::test]
    async fn test_forge_server_error_fails() {
        let rig = TestRig::with_probe(
            FakeReachability::default().with_https("https://sovereign-forge.tail1234.ts.net/", 500),
        );
        let forge = running_forge(&rig);

        let report = Doctor::new(&rig.controller).verify(&forge).await;
        assert_eq!(report.failed_names(), vec!["https web"]);
    }

    #[tokio::test]
    async fn test_vault_api_failure_fails() {
        let rig = TestRig::with_probe(
            FakeReachability::default()
                .with_https("https://sovereign-vault.tail1234.ts.net/", 200)
                .with_https("https://sovereign-vault.tail1234.ts.net/api/config", 404),
        );
        let vault = rig.service("vault");
        rig.device
            .add_process(7, "crosvm run /data/sovereign/vm/vault/rootfs.img", Duration::ZERO, None);
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

        let err = Doctor::new(&rig.controller).run_tests(&vault).await.unwrap_err();
        match err {
            SovereignError::TestsFailed { failed, .. } => assert_eq!(failed, vec!["https api"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failures_are_an_error() {
        let rig = TestRig::new();
        let sql = rig.service("sql");
        rig.device
            .add_process(9, "crosvm run /data/sovereign/vm/sql/rootfs.img", Duration::ZERO, None);

        let doctor = Doctor::new(&rig.controller);
        let report = doctor.verify(&sql).await;
        assert!(report.results[0].passed);
        assert_eq!(
            report.failed_names(),
            vec!["interface vm_sql", "identity connected", "port 5432"]
        );

        let err = doctor.run_tests(&sql).await.unwrap_err();
        match err {
            SovereignError::TestsFailed { service, failed } => {
                assert_eq!(service, "sql");
                assert_eq!(failed.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
