use super::LifecycleController;
use crate::boot::BootReport;
use crate::service::ServiceDescriptor;
use sovereign_shared::errors::{SovereignError, SovereignResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    pub skip_dependency_check: bool,
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started {
        pid: Option<u32>,
        boot: BootReport,
    },
    /// Nothing was done; the guest was already up.
    AlreadyRunning { pid: u32 },
}

impl StartOutcome {
    pub fn pid(&self) -> Option<u32> {
        match self {
            StartOutcome::Started { pid, .. } => *pid,
            StartOutcome::AlreadyRunning { pid } => Some(*pid),
        }
    }
}

pub(super) async fn start(
    controller: &LifecycleController,
    service: &ServiceDescriptor,
    opts: StartOptions,
) -> SovereignResult<StartOutcome> {
    let name = service.name();

    if let Some(pid) = controller.find_pid(service).await? {
        tracing::warn!(
            service = name,
            pid,
            "Already running; stop it first to restart"
        );
        return Ok(StartOutcome::AlreadyRunning { pid });
    }

    if opts.skip_dependency_check {
        tracing::info!(service = name, "Skipping dependency check");
    } else {
        controller.resolver().check(service).await?;
    }

    let command = launch_command(controller, service).await?;

    let device = controller.device();
    let daemon_log = controller.options.device.daemon_log(name);
    let console = service.console_log();
    let socket = service.vm_socket();
    let pid_file = service.pid_file();
    device
        .remove_files(&[&console, &socket, &pid_file, &daemon_log])
        .await;

    tracing::info!(service = name, command = %command, "Launching guest");
    let ticket = device.launch_detached(&command).await?;
    tracing::debug!(service = name, launcher_pid = ?ticket.launcher_pid, "Launcher detached");

    tokio::time::sleep(controller.options.timing.launch_settle()).await;

    let boot = controller.boot_monitor().stream_boot_logs(service).await?;
    let pid = match boot.pid {
        Some(pid) => Some(pid),
        None => controller.find_pid(service).await.ok().flatten(),
    };

    tracing::info!(
        service = name,
        pid = ?pid,
        elapsed_ms = boot.elapsed.as_millis() as u64,
        "Guest ready"
    );
    Ok(StartOutcome::Started { pid, boot })
}

/// Supervisor daemon when installed, else the deployed start script.
async fn launch_command(
    controller: &LifecycleController,
    service: &ServiceDescriptor,
) -> SovereignResult<String> {
    let device = controller.device();
    let script = service.start_script();
    if !device.file_exists(&script).await? {
        return Err(SovereignError::NotDeployed {
            service: service.name().to_string(),
        });
    }

    let daemon = &controller.options.device.daemon_script;
    if device.file_exists(daemon).await? {
        Ok(format!("{} start {}", daemon, service.name()))
    } else {
        Ok(format!("sh {}", script))
    }
}
