//! Lifecycle orchestration and self-healing for guest VMs on a rooted
//! Android hypervisor host.
//!
//! The crate drives three guests (PostgreSQL, Forgejo, Vaultwarden) over
//! `adb`: deploy artifacts, start with dependency and boot-readiness
//! checks, stop with network teardown, and diagnose or repair a broken
//! guest. Each guest keeps one stable overlay-network identity across
//! restarts.

pub mod boot;
pub mod dependency;
pub mod device;
pub mod doctor;
pub mod identity;
pub mod lifecycle;
pub mod network;
pub mod options;
pub mod probe;
pub mod saga;
pub mod service;

#[cfg(test)]
mod testing;

pub use boot::{BootMonitor, BootPhase, BootReport};
pub use dependency::{DependencyInfo, DependencyResolver};
pub use device::{AdbDevice, Device};
pub use doctor::Doctor;
pub use identity::{IdentityManager, TailscalePlane};
pub use lifecycle::LifecycleController;
pub use options::SovereignOptions;
pub use probe::{NetProber, Reachability};
pub use service::{ServiceDescriptor, ServiceTable};
pub use sovereign_shared::errors::{SovereignError, SovereignResult};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber: human output on stderr plus a daily log
/// file under `<state_dir>/logs`.
///
/// `RUST_LOG` overrides the default `info` filter. Keep the returned guard
/// alive for the life of the process or buffered file output is lost.
///
/// # Errors
/// `Config` if the log directory cannot be created or a subscriber is
/// already installed.
pub fn init_logging(options: &SovereignOptions) -> SovereignResult<WorkerGuard> {
    let log_dir = options.state_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|e| {
        SovereignError::Config(format!(
            "cannot create log directory {}: {}",
            log_dir.display(),
            e
        ))
    })?;

    let file = tracing_appender::rolling::daily(&log_dir, "sovereign.log");
    let (writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .map_err(|e| SovereignError::Config(format!("logging already initialized: {}", e)))?;

    Ok(guard)
}
