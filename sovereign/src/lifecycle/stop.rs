use super::LifecycleController;
use crate::device::{Signal, watchdog_pattern};
use crate::network::teardown_commands;
use crate::service::ServiceDescriptor;
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::time::Duration;
use tokio::time::Instant;

/// Pause between SIGKILL and the next process lookup.
const KILL_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOutcome {
    /// Pid that was signalled, if the guest was running.
    pub pid_stopped: Option<u32>,
    /// Whether SIGKILL was needed.
    pub forced: bool,
}

/// Stop the guest and undo its host-side network setup.
///
/// The watchdog goes first so it cannot relaunch the guest. After SIGTERM
/// every process still matching the guest pattern is killed until none is
/// left or the stop wait runs out a second time.
///
/// # Errors
/// * a failed process lookup
/// * `StillRunning` - a matching process survived
pub(super) async fn stop(
    controller: &LifecycleController,
    service: &ServiceDescriptor,
) -> SovereignResult<StopOutcome> {
    let name = service.name();
    let device = controller.device();
    let stop_wait = controller.options.timing.stop_wait();
    let mut outcome = StopOutcome::default();

    device.kill_matching(&watchdog_pattern(name)).await;

    match controller.find_pid(service).await? {
        Some(pid) => {
            tracing::info!(service = name, pid, "Stopping guest");
            device.signal(pid, Signal::Term).await;
            tokio::time::sleep(stop_wait).await;
            outcome.pid_stopped = Some(pid);
        }
        None => tracing::info!(service = name, "Guest not running"),
    }

    let deadline = Instant::now() + stop_wait;
    while let Some(pid) = controller.find_pid(service).await? {
        if Instant::now() >= deadline {
            tracing::error!(service = name, pid, "Guest survived stop");
            return Err(SovereignError::StillRunning {
                service: name.to_string(),
                pid,
            });
        }
        tracing::warn!(service = name, pid, "Guest still running, killing");
        device.signal(pid, Signal::Kill).await;
        outcome.forced = true;
        tokio::time::sleep(KILL_SETTLE).await;
    }

    for command in teardown_commands(service, &controller.options.network) {
        device.exec_quiet(&command).await;
    }
    device.remove_files(&[&service.pid_file()]).await;

    tracing::info!(service = name, forced = outcome.forced, "Stopped");
    Ok(outcome)
}
