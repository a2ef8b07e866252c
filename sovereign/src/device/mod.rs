//! Remote device access.
//!
//! [`Device`] is the narrow seam between orchestration logic and the phone:
//! deadline-bounded command execution, single-file push and detached launch.
//! Every typed query (file checks, process lookup, log reads, link state) is a
//! provided method expressed through `exec`, so an alternative transport only
//! needs the three required methods.

mod adb;
mod process;

pub use adb::AdbDevice;
pub use process::{Signal, find_pid_command, parse_pid, self_match_safe, watchdog_pattern};

use async_trait::async_trait;
use sovereign_shared::errors::SovereignResult;
use std::path::Path;
use std::time::Duration;

/// Acknowledgement that a detached launch was accepted.
///
/// It says nothing about the guest; readiness is established by the boot
/// monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTicket {
    pub command: String,
    /// Pid of the local launcher process, if one was spawned.
    pub launcher_pid: Option<u32>,
}

#[async_trait]
pub trait Device: Send + Sync {
    /// Run `command` as root on the device, failing after `deadline`.
    ///
    /// Returns captured stdout. Output is not trimmed.
    async fn exec(&self, command: &str, deadline: Duration) -> SovereignResult<String>;

    /// Copy a local file to `remote`.
    async fn push_file(&self, local: &Path, remote: &str) -> SovereignResult<()>;

    /// Start `command` detached from this process and return immediately.
    async fn launch_detached(&self, command: &str) -> SovereignResult<LaunchTicket>;

    /// Deadline for ordinary commands.
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Deadline for cleanup, probe and polling commands.
    fn quick_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Run a cleanup command, swallowing every failure.
    async fn exec_quiet(&self, command: &str) -> Option<String> {
        match self.exec(command, self.quick_timeout()).await {
            Ok(out) => Some(out),
            Err(e) => {
                tracing::debug!(command, error = %e, "Ignored command failure");
                None
            }
        }
    }

    async fn is_connected(&self) -> bool {
        matches!(self.exec_quiet("echo ok").await, Some(out) if out.trim() == "ok")
    }

    async fn file_exists(&self, path: &str) -> SovereignResult<bool> {
        let out = self
            .exec(
                &format!("[ -f {} ] && echo yes || echo no", path),
                self.command_timeout(),
            )
            .await?;
        Ok(out.trim() == "yes")
    }

    async fn dir_exists(&self, path: &str) -> SovereignResult<bool> {
        let out = self
            .exec(
                &format!("[ -d {} ] && echo yes || echo no", path),
                self.command_timeout(),
            )
            .await?;
        Ok(out.trim() == "yes")
    }

    async fn mkdir_p(&self, path: &str) -> SovereignResult<()> {
        self.exec(&format!("mkdir -p {}", path), self.command_timeout())
            .await
            .map(|_| ())
    }

    async fn chmod_exec(&self, path: &str) -> SovereignResult<()> {
        self.exec(&format!("chmod +x {}", path), self.command_timeout())
            .await
            .map(|_| ())
    }

    /// `rm -f` every path; missing files are not an error.
    async fn remove_files(&self, paths: &[&str]) {
        if paths.is_empty() {
            return;
        }
        self.exec_quiet(&format!("rm -f {}", paths.join(" "))).await;
    }

    async fn remove_dir_all(&self, path: &str) -> SovereignResult<()> {
        self.exec(&format!("rm -rf {}", path), self.command_timeout())
            .await
            .map(|_| ())
    }

    async fn copy_file(&self, from: &str, to: &str) -> SovereignResult<()> {
        self.exec(&format!("cp {} {}", from, to), self.command_timeout())
            .await
            .map(|_| ())
    }

    /// First pid whose command line matches `pattern`.
    ///
    /// Polled during boot and stop, so it runs under the quick timeout.
    async fn find_process(&self, pattern: &str) -> SovereignResult<Option<u32>> {
        let out = self
            .exec(&find_pid_command(pattern), self.quick_timeout())
            .await?;
        Ok(parse_pid(&out))
    }

    /// Full `ps` line for a pid, for diagnostics.
    async fn process_details(&self, pid: u32) -> Option<String> {
        let out = self
            .exec_quiet(&format!("ps -p {} -o pid,etime,rss,args 2>/dev/null | tail -1", pid))
            .await?;
        let line = out.trim();
        (!line.is_empty()).then(|| line.to_string())
    }

    async fn signal(&self, pid: u32, signal: Signal) {
        self.exec_quiet(&format!("kill {} {} 2>/dev/null", signal.as_arg(), pid))
            .await;
    }

    /// Kill every process matching `pattern`.
    async fn kill_matching(&self, pattern: &str) {
        self.exec_quiet(&format!(
            "pkill -f '{}' 2>/dev/null",
            self_match_safe(pattern)
        ))
        .await;
    }

    /// Complete lines of `path` after the first `offset` lines.
    ///
    /// A trailing line without a newline is still being written and is held
    /// back until a later read. Runs under the quick timeout.
    async fn read_lines_from(&self, path: &str, offset: usize) -> SovereignResult<Vec<String>> {
        let out = self
            .exec(
                &format!("tail -n +{} {} 2>/dev/null || true", offset + 1, path),
                self.quick_timeout(),
            )
            .await?;
        Ok(complete_lines(&out))
    }

    async fn tail(&self, path: &str, lines: usize) -> SovereignResult<Vec<String>> {
        let out = self
            .exec(
                &format!("tail -n {} {} 2>/dev/null || true", lines, path),
                self.command_timeout(),
            )
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Last `lines` matches of an extended, case-insensitive regex.
    async fn grep_tail(
        &self,
        path: &str,
        pattern: &str,
        lines: usize,
    ) -> SovereignResult<Vec<String>> {
        let out = self
            .exec(
                &format!("grep -iE '{}' {} 2>/dev/null | tail -{}", pattern, path, lines),
                self.command_timeout(),
            )
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// `ip link show` output for an interface, `None` when it does not exist.
    async fn link_show(&self, iface: &str) -> SovereignResult<Option<String>> {
        let out = self
            .exec(
                &format!("ip link show {} 2>/dev/null || true", iface),
                self.command_timeout(),
            )
            .await?;
        Ok((!out.trim().is_empty()).then_some(out))
    }

    /// Names of interfaces enslaved to `bridge`.
    async fn bridge_members(&self, bridge: &str) -> SovereignResult<Vec<String>> {
        let out = self
            .exec(
                &format!("ip link show master {} 2>/dev/null || true", bridge),
                self.command_timeout(),
            )
            .await?;
        Ok(crate::network::parse_link_names(&out))
    }

    /// TCP connect test from the device side.
    async fn port_open(&self, ip: &str, port: u16) -> bool {
        let out = self
            .exec_quiet(&format!(
                "timeout 2 nc -zv {} {} >/dev/null 2>&1 && echo open || echo closed",
                ip, port
            ))
            .await;
        matches!(out, Some(o) if o.trim() == "open")
    }
}

/// Split output into lines, dropping an unterminated final line.
pub(crate) fn complete_lines(output: &str) -> Vec<String> {
    let complete = match output.rfind('\n') {
        Some(idx) => &output[..idx + 1],
        None => "",
    };
    complete.lines().map(str::to_string).collect()
}

/// Quote `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
