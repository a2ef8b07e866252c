use super::rules::{LogClass, RuleTable};
use crate::device::Device;
use crate::options::TimingOptions;
use crate::service::ServiceDescriptor;
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    Booting,
    KernelUp,
    Ready,
    Failed,
    TimedOut,
}

impl BootPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, BootPhase::Ready | BootPhase::Failed | BootPhase::TimedOut)
    }
}

#[derive(Debug, Clone)]
pub struct BootSettings {
    pub poll_interval: Duration,
    /// Absence of the guest process is tolerated for this long.
    pub process_grace: Duration,
    /// Pause after the readiness marker before reporting success.
    pub ready_settle: Duration,
}

impl BootSettings {
    pub fn from_timing(timing: &TimingOptions) -> Self {
        Self {
            poll_interval: timing.poll_interval(),
            process_grace: timing.process_grace(),
            ready_settle: timing.ready_settle(),
        }
    }
}

impl Default for BootSettings {
    fn default() -> Self {
        Self::from_timing(&TimingOptions::default())
    }
}

/// Number of console lines already consumed. Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCursor {
    consumed: usize,
}

impl LogCursor {
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn advance(&mut self) {
        self.consumed += 1;
    }
}

#[derive(Debug, Clone)]
pub struct BootReport {
    pub phase: BootPhase,
    pub lines_consumed: usize,
    pub elapsed: Duration,
    pub kernel_up_at: Option<Duration>,
    pub pid: Option<u32>,
}

/// Follows a guest's console log until it is ready, failed or out of time.
pub struct BootMonitor<'a> {
    device: &'a dyn Device,
    settings: BootSettings,
}

impl<'a> BootMonitor<'a> {
    pub fn new(device: &'a dyn Device, settings: BootSettings) -> Self {
        Self { device, settings }
    }

    /// Stream the console of `service` and classify its boot.
    ///
    /// Each poll reads only lines past the cursor, classifies them in order,
    /// then checks the guest process. Read or lookup failures count as
    /// "nothing new" and are retried on the next poll.
    ///
    /// # Errors
    /// * `BootFatal` - a fatal marker was logged
    /// * `ProcessDied` - the process is absent after the grace period
    /// * `BootTimeout` - the service's start timeout elapsed
    pub async fn stream_boot_logs(&self, service: &ServiceDescriptor) -> SovereignResult<BootReport> {
        let name = service.name();
        let log_path = service.console_log();
        let rules = RuleTable::for_service(service);
        let timeout = service.start_timeout();

        let start = Instant::now();
        let mut cursor = LogCursor::default();
        let mut phase = BootPhase::Booting;
        let mut kernel_up_at = None;
        let mut ever_seen = false;
        let mut pid = None;

        tracing::info!(
            service = name,
            timeout_secs = timeout.as_secs(),
            marker = service.ready_marker(),
            "Waiting for guest boot"
        );

        loop {
            if start.elapsed() > timeout {
                tracing::error!(service = name, phase = ?phase, "Boot timed out");
                return Err(SovereignError::BootTimeout {
                    service: name.to_string(),
                    timeout_secs: timeout.as_secs(),
                    log_path,
                });
            }

            match self.device.read_lines_from(&log_path, cursor.consumed()).await {
                Ok(lines) => {
                    for line in lines {
                        cursor.advance();
                        tracing::info!(target: "guest_console", service = name, "{}", line);

                        match rules.classify(&line) {
                            Some(LogClass::Ready) => {
                                tracing::info!(
                                    service = name,
                                    elapsed_ms = start.elapsed().as_millis() as u64,
                                    "Readiness marker seen, settling"
                                );
                                tokio::time::sleep(self.settings.ready_settle).await;
                                return Ok(BootReport {
                                    phase: BootPhase::Ready,
                                    lines_consumed: cursor.consumed(),
                                    elapsed: start.elapsed(),
                                    kernel_up_at,
                                    pid,
                                });
                            }
                            Some(LogClass::Fatal) => {
                                tracing::error!(service = name, line = %line, "Fatal boot marker");
                                return Err(SovereignError::BootFatal {
                                    service: name.to_string(),
                                    line,
                                });
                            }
                            Some(LogClass::KernelUp) if phase == BootPhase::Booting => {
                                phase = BootPhase::KernelUp;
                                kernel_up_at = Some(start.elapsed());
                                tracing::info!(service = name, "Guest kernel up");
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) => tracing::debug!(service = name, error = %e, "Console read failed"),
            }

            match self.device.find_process(service.process_pattern()).await {
                Ok(Some(found)) => {
                    if !ever_seen {
                        tracing::info!(service = name, pid = found, "Guest process up");
                    }
                    ever_seen = true;
                    pid = Some(found);
                }
                Ok(None) if start.elapsed() > self.settings.process_grace => {
                    tracing::error!(service = name, ever_seen, "Guest process gone");
                    return Err(SovereignError::ProcessDied {
                        service: name.to_string(),
                        log_path,
                    });
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(service = name, error = %e, "Process lookup failed"),
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}
