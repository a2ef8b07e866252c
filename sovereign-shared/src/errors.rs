//! Error taxonomy for guest lifecycle orchestration.
//!
//! Operator-facing variants carry enough context to name the next command
//! to run; see [`SovereignError::next_command`].

use thiserror::Error;

/// Result alias used across the orchestrator.
pub type SovereignResult<T> = Result<T, SovereignError>;

#[derive(Debug, Error)]
pub enum SovereignError {
    /// A local build output required for deploy is absent.
    #[error("{service}: missing artifact {path} (run 'sovereign build --{service}' first)")]
    MissingArtifact { service: String, path: String },

    /// The local credential file required for deploy is absent.
    #[error(
        "{service}: credential file not found at {path} (create it, then run 'sovereign deploy --{service}')"
    )]
    MissingCredentialFile { service: String, path: String },

    /// The service has no startup script on the device.
    #[error("{service}: not deployed on device (run 'sovereign deploy --{service}' first)")]
    NotDeployed { service: String },

    /// An upstream service could not be resolved or reached.
    #[error("dependency {dependency} unavailable: {reason} (run '{next}')")]
    DependencyUnavailable {
        dependency: String,
        reason: String,
        next: String,
    },

    #[error(
        "{service}: boot timed out after {timeout_secs}s (inspect with 'adb shell cat {log_path}')"
    )]
    BootTimeout {
        service: String,
        timeout_secs: u64,
        log_path: String,
    },

    /// A fatal marker appeared in the guest console.
    #[error("{service}: boot failed: {line} (run 'sovereign diagnose --{service}')")]
    BootFatal { service: String, line: String },

    #[error("{service}: VM process died during boot (inspect with 'adb shell cat {log_path}')")]
    ProcessDied { service: String, log_path: String },

    #[error(
        "{service}: directory {path} still exists after removal (run \"adb shell su -c 'rm -rf {path}'\")"
    )]
    DirectoryRemovalFailed { service: String, path: String },

    /// A guest process still matched after stop gave up.
    #[error("{service}: pid {pid} still running after stop (run 'sovereign diagnose --{service}')")]
    StillRunning { service: String, pid: u32 },

    /// Registrations exist but no management API key is available.
    #[error(
        "cannot remove {} registration(s) without an API key: {}; set {env_var} or delete them manually at {manual_url}",
        peers.len(),
        peers.join(", ")
    )]
    CredentialUnavailable {
        peers: Vec<String>,
        env_var: String,
        manual_url: String,
    },

    /// Post-start verification found failing checks.
    #[error("{service}: {} test(s) failed: {}", failed.len(), failed.join(", "))]
    TestsFailed { service: String, failed: Vec<String> },

    #[error("command timed out after {timeout_secs}s: {command} (check the connection with 'adb devices')")]
    CommandTimeout { command: String, timeout_secs: u64 },

    #[error("device error: {0}")]
    Device(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SovereignError {
    /// The concrete command an operator should run next, when one exists.
    pub fn next_command(&self) -> Option<String> {
        match self {
            Self::MissingArtifact { service, .. } => Some(format!("sovereign build --{service}")),
            Self::MissingCredentialFile { service, .. } | Self::NotDeployed { service } => {
                Some(format!("sovereign deploy --{service}"))
            }
            Self::DependencyUnavailable { next, .. } => Some(next.clone()),
            Self::BootTimeout { log_path, .. } | Self::ProcessDied { log_path, .. } => {
                Some(format!("adb shell cat {log_path}"))
            }
            Self::BootFatal { service, .. }
            | Self::TestsFailed { service, .. }
            | Self::StillRunning { service, .. } => {
                Some(format!("sovereign diagnose --{service}"))
            }
            Self::DirectoryRemovalFailed { path, .. } => {
                Some(format!("adb shell su -c 'rm -rf {path}'"))
            }
            Self::CredentialUnavailable { env_var, .. } => {
                Some(format!("export {env_var}=<api key>"))
            }
            Self::CommandTimeout { .. } => Some("adb devices".to_string()),
            _ => None,
        }
    }

    /// Whether the error comes from a boot attempt that reached the monitor.
    pub fn is_boot_failure(&self) -> bool {
        matches!(
            self,
            Self::BootTimeout { .. } | Self::BootFatal { .. } | Self::ProcessDied { .. }
        )
    }
}
