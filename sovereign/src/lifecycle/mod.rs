//! Guest lifecycle: deploy, start, stop, remove, clean.
//!
//! The controller owns its collaborators and the per-instance idempotency
//! state (the one-time watchdog install). It never caches runtime state;
//! every operation rediscovers the guest process by pattern.

mod deploy;
mod remove;
mod start;
mod stop;

pub use deploy::{DataVolumeAction, DeployOptions, DeployReport};
pub use remove::RemoveReport;
pub use start::{StartOptions, StartOutcome};
pub use stop::StopOutcome;

use crate::boot::{BootMonitor, BootSettings};
use crate::dependency::DependencyResolver;
use crate::device::Device;
use crate::identity::{IdentityManager, RemovalReport};
use crate::options::SovereignOptions;
use crate::probe::Reachability;
use crate::service::ServiceDescriptor;
use sovereign_shared::errors::SovereignResult;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct LifecycleController {
    device: Arc<dyn Device>,
    identity: Arc<IdentityManager>,
    probe: Arc<dyn Reachability>,
    options: SovereignOptions,
    /// Set once the boot watchdog has been installed by this instance.
    watchdog_installed: Arc<Mutex<bool>>,
}

impl LifecycleController {
    pub fn new(
        device: Arc<dyn Device>,
        identity: Arc<IdentityManager>,
        probe: Arc<dyn Reachability>,
        options: SovereignOptions,
    ) -> Self {
        Self {
            device,
            identity,
            probe,
            options,
            watchdog_installed: Arc::new(Mutex::new(false)),
        }
    }

    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    pub fn identity(&self) -> &IdentityManager {
        &self.identity
    }

    pub fn probe(&self) -> &dyn Reachability {
        self.probe.as_ref()
    }

    pub fn options(&self) -> &SovereignOptions {
        &self.options
    }

    pub fn resolver(&self) -> DependencyResolver<'_> {
        DependencyResolver::new(
            &self.identity,
            self.probe.as_ref(),
            self.options.timing.probe_timeout(),
        )
    }

    pub fn boot_monitor(&self) -> BootMonitor<'_> {
        BootMonitor::new(
            self.device.as_ref(),
            BootSettings::from_timing(&self.options.timing),
        )
    }

    /// Pid of the running guest, if any.
    pub async fn find_pid(&self, service: &ServiceDescriptor) -> SovereignResult<Option<u32>> {
        self.device.find_process(service.process_pattern()).await
    }

    pub async fn deploy(
        &self,
        service: &ServiceDescriptor,
        opts: DeployOptions,
    ) -> SovereignResult<DeployReport> {
        deploy::deploy(self, service, opts).await
    }

    pub async fn start(
        &self,
        service: &ServiceDescriptor,
        opts: StartOptions,
    ) -> SovereignResult<StartOutcome> {
        start::start(self, service, opts).await
    }

    pub async fn stop(&self, service: &ServiceDescriptor) -> SovereignResult<StopOutcome> {
        stop::stop(self, service).await
    }

    pub async fn remove(&self, service: &ServiceDescriptor) -> SovereignResult<RemoveReport> {
        remove::remove(self, service).await
    }

    /// Delete every identity registration held by `service`.
    pub async fn clean(&self, service: &ServiceDescriptor) -> SovereignResult<RemovalReport> {
        tracing::info!(service = service.name(), host = service.identity_host(), "Cleaning identity registrations");
        self.identity
            .remove_registrations(service.identity_host())
            .await
    }
}
