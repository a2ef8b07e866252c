//! [`Device`] over `adb shell su -c`.

use super::{Device, LaunchTicket, shell_quote};
use crate::options::SovereignOptions;
use async_trait::async_trait;
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

/// Rooted Android device reached through adb.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    serial: Option<String>,
    staging_dir: String,
    command_timeout: Duration,
    quick_timeout: Duration,
}

impl AdbDevice {
    pub fn new(options: &SovereignOptions) -> Self {
        Self {
            serial: options.device.serial.clone(),
            staging_dir: options.device.staging_dir.trim_end_matches('/').to_string(),
            command_timeout: options.timing.command_timeout(),
            quick_timeout: options.timing.quick_timeout(),
        }
    }

    fn base_args(&self) -> Vec<String> {
        match &self.serial {
            Some(serial) => vec!["-s".to_string(), serial.clone()],
            None => Vec::new(),
        }
    }

    fn root_shell_args(&self, command: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(["shell", "su", "-c"].map(String::from));
        args.push(shell_quote(command));
        args
    }

    async fn run_adb(&self, args: &[String], deadline: Option<Duration>) -> SovereignResult<String> {
        let mut cmd = tokio::process::Command::new("adb");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, cmd.output())
                .await
                .map_err(|_| SovereignError::CommandTimeout {
                    command: args.join(" "),
                    timeout_secs: deadline.as_secs(),
                })?,
            None => cmd.output().await,
        }
        .map_err(|e| SovereignError::Device(format!("failed to run adb: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SovereignError::Device(format!(
                "adb {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Device for AdbDevice {
    async fn exec(&self, command: &str, deadline: Duration) -> SovereignResult<String> {
        tracing::trace!(command, "adb exec");
        self.run_adb(&self.root_shell_args(command), Some(deadline))
            .await
    }

    async fn push_file(&self, local: &Path, remote: &str) -> SovereignResult<()> {
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                SovereignError::InvalidArgument(format!("not a file path: {}", local.display()))
            })?;
        let staged = format!("{}/{}", self.staging_dir, file_name);

        let mut args = self.base_args();
        args.push("push".to_string());
        args.push(local.display().to_string());
        args.push(staged.clone());
        // Image pushes can take minutes; only the mv is deadline-bound.
        self.run_adb(&args, None).await?;

        self.exec(&format!("mv {} {}", staged, remote), self.command_timeout)
            .await?;
        tracing::info!(local = %local.display(), remote, "Pushed file");
        Ok(())
    }

    async fn launch_detached(&self, command: &str) -> SovereignResult<LaunchTicket> {
        let mut cmd = std::process::Command::new("adb");
        cmd.args(self.root_shell_args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // New session: the launcher must survive this process and its
        // terminal's signals.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let child = cmd.spawn().map_err(|e| {
            let msg = format!("failed to launch '{}': {}", command, e);
            tracing::error!("{}", msg);
            SovereignError::Device(msg)
        })?;
        let launcher_pid = child.id();
        // Disowned: never waited on, rediscovered later by pattern.
        drop(child);

        tracing::info!(command, launcher_pid, "Launch request accepted");
        Ok(LaunchTicket {
            command: command.to_string(),
            launcher_pid: Some(launcher_pid),
        })
    }

    fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    fn quick_timeout(&self) -> Duration {
        self.quick_timeout
    }
}
