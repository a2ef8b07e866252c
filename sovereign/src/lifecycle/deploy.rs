//! Deploy saga.
//!
//! ```text
//! 1. verify_artifacts ─┬─   (local images, kernel, start script)
//!    verify_credentials ┘   (local .env)
//! 2. prepare_directory      (mkdir -p + verify)
//!    push_rootfs
//!    push_kernel            (bundled or shared)
//!    push_data_volume       (kept if present unless fresh)
//!    push_credentials
//!    push_start_script      (push + chmod)
//!    install_watchdog       (once per controller, failure is a warning)
//! ```

use super::LifecycleController;
use crate::device::Device;
use crate::identity::IdentityManager;
use crate::options::SovereignOptions;
use crate::saga::{BoxedStep, Saga, SagaMetrics, SagaRunner, SagaStep, Stage};
use crate::service::ServiceDescriptor;
use async_trait::async_trait;
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOptions {
    /// Replace the data volume, discarding the guest's stored identity.
    pub fresh_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataVolumeAction {
    /// First deploy.
    Pushed,
    /// Existing volume kept, identity preserved.
    Preserved,
    /// Fresh volume forced; old registrations removed first.
    Replaced,
}

#[derive(Debug, Clone)]
pub struct DeployReport {
    pub data_volume: DataVolumeAction,
    /// Whether this deploy installed the boot watchdog.
    pub watchdog_installed: bool,
    pub metrics: SagaMetrics,
}

struct DeployContext {
    device: Arc<dyn Device>,
    identity: Arc<IdentityManager>,
    service: ServiceDescriptor,
    options: SovereignOptions,
    fresh_data: bool,
    watchdog_installed: Arc<Mutex<bool>>,
    data_volume: std::sync::Mutex<Option<DataVolumeAction>>,
    installed_watchdog: std::sync::Mutex<bool>,
}

impl DeployContext {
    fn local(&self, file: &str) -> PathBuf {
        self.options
            .local_path(&self.service.local_path().join(file))
    }

    fn remote(&self, file: &str) -> String {
        format!("{}/{}", self.service.device_path(), file)
    }
}

type DeployCtx = Arc<DeployContext>;

fn deploy_saga() -> Saga<DeployCtx> {
    let stages: Vec<Stage<BoxedStep<DeployCtx>>> = vec![
        Stage::concurrent(vec![
            Box::new(VerifyArtifactsStep),
            Box::new(VerifyCredentialsStep),
        ]),
        Stage::sequential(vec![
            Box::new(PrepareDirectoryStep),
            Box::new(PushRootfsStep),
            Box::new(PushKernelStep),
            Box::new(PushDataVolumeStep),
            Box::new(PushCredentialsStep),
            Box::new(PushStartScriptStep),
            Box::new(InstallWatchdogStep),
        ]),
    ];
    Saga::new("deploy", stages)
}

pub(super) async fn deploy(
    controller: &LifecycleController,
    service: &ServiceDescriptor,
    opts: DeployOptions,
) -> SovereignResult<DeployReport> {
    tracing::info!(
        service = service.name(),
        display = service.display_name(),
        fresh_data = opts.fresh_data,
        "Deploying"
    );

    let ctx = Arc::new(DeployContext {
        device: Arc::clone(&controller.device),
        identity: Arc::clone(&controller.identity),
        service: service.clone(),
        options: controller.options.clone(),
        fresh_data: opts.fresh_data,
        watchdog_installed: Arc::clone(&controller.watchdog_installed),
        data_volume: std::sync::Mutex::new(None),
        installed_watchdog: std::sync::Mutex::new(false),
    });

    let metrics = SagaRunner::run(deploy_saga(), Arc::clone(&ctx)).await?;
    metrics.log_summary();

    let data_volume = ctx
        .data_volume
        .lock()
        .map_err(|e| SovereignError::Internal(format!("deploy state poisoned: {}", e)))?
        .ok_or_else(|| SovereignError::Internal("data volume step did not run".into()))?;
    let watchdog_installed = *ctx
        .installed_watchdog
        .lock()
        .map_err(|e| SovereignError::Internal(format!("deploy state poisoned: {}", e)))?;

    tracing::info!(
        service = service.name(),
        data_volume = ?data_volume,
        "Deployed; next: sovereign start --{}",
        service.name()
    );
    Ok(DeployReport {
        data_volume,
        watchdog_installed,
        metrics,
    })
}

struct VerifyArtifactsStep;

#[async_trait]
impl SagaStep<DeployCtx> for VerifyArtifactsStep {
    async fn run(self: Box<Self>, ctx: DeployCtx) -> SovereignResult<()> {
        let mut required = vec![
            ctx.local("rootfs.img"),
            ctx.local("data.img"),
            ctx.options.local_path(&ctx.service.local_kernel()),
            ctx.local("start.sh"),
        ];
        required.dedup();

        for path in required {
            if !path.is_file() {
                return Err(SovereignError::MissingArtifact {
                    service: ctx.service.name().to_string(),
                    path: path.display().to_string(),
                });
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "verify_artifacts"
    }
}

struct VerifyCredentialsStep;

#[async_trait]
impl SagaStep<DeployCtx> for VerifyCredentialsStep {
    async fn run(self: Box<Self>, ctx: DeployCtx) -> SovereignResult<()> {
        let path = ctx.options.local_path(&ctx.options.credential_file);
        if !path.is_file() {
            return Err(SovereignError::MissingCredentialFile {
                service: ctx.service.name().to_string(),
                path: path.display().to_string(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "verify_credentials"
    }
}

struct PrepareDirectoryStep;

#[async_trait]
impl SagaStep<DeployCtx> for PrepareDirectoryStep {
    async fn run(self: Box<Self>, ctx: DeployCtx) -> SovereignResult<()> {
        let dir = ctx.service.device_path();
        ctx.device.mkdir_p(dir).await?;
        if !ctx.device.dir_exists(dir).await? {
            return Err(SovereignError::Device(format!(
                "failed to create {} on device",
                dir
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "prepare_directory"
    }
}

struct PushRootfsStep;

#[async_trait]
impl SagaStep<DeployCtx> for PushRootfsStep {
    async fn run(self: Box<Self>, ctx: DeployCtx) -> SovereignResult<()> {
        tracing::info!(service = ctx.service.name(), "Pushing rootfs.img");
        ctx.device
            .push_file(&ctx.local("rootfs.img"), &ctx.remote("rootfs.img"))
            .await
    }

    fn name(&self) -> &'static str {
        "push_rootfs"
    }
}

struct PushDataVolumeStep;

#[async_trait]
impl SagaStep<DeployCtx> for PushDataVolumeStep {
    async fn run(self: Box<Self>, ctx: DeployCtx) -> SovereignResult<()> {
        let name = ctx.service.name();
        let remote = ctx.remote("data.img");

        let action = if ctx.fresh_data {
            tracing::info!(service = name, "Fresh data requested, removing old registrations");
            if let Err(e) = ctx
                .identity
                .remove_registrations(ctx.service.identity_host())
                .await
            {
                tracing::warn!(service = name, error = %e, "Registration cleanup failed");
            }
            ctx.device.push_file(&ctx.local("data.img"), &remote).await?;
            DataVolumeAction::Replaced
        } else if ctx.device.file_exists(&remote).await? {
            tracing::info!(service = name, "Preserving existing data.img (holds guest identity)");
            DataVolumeAction::Preserved
        } else {
            tracing::info!(service = name, "Pushing data.img (first deploy)");
            ctx.device.push_file(&ctx.local("data.img"), &remote).await?;
            DataVolumeAction::Pushed
        };

        *ctx
            .data_volume
            .lock()
            .map_err(|e| SovereignError::Internal(format!("deploy state poisoned: {}", e)))? =
            Some(action);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "push_data_volume"
    }
}

struct PushKernelStep;

#[async_trait]
impl SagaStep<DeployCtx> for PushKernelStep {
    async fn run(self: Box<Self>, ctx: DeployCtx) -> SovereignResult<()> {
        let kernel = ctx.options.local_path(&ctx.service.local_kernel());
        tracing::info!(service = ctx.service.name(), kernel = %kernel.display(), "Pushing kernel");
        ctx.device.push_file(&kernel, &ctx.remote("Image")).await
    }

    fn name(&self) -> &'static str {
        "push_kernel"
    }
}

struct PushCredentialsStep;

#[async_trait]
impl SagaStep<DeployCtx> for PushCredentialsStep {
    async fn run(self: Box<Self>, ctx: DeployCtx) -> SovereignResult<()> {
        let local = ctx.options.local_path(&ctx.options.credential_file);
        ctx.device
            .push_file(&local, &ctx.options.device.remote_credential_path)
            .await
    }

    fn name(&self) -> &'static str {
        "push_credentials"
    }
}

struct PushStartScriptStep;

#[async_trait]
impl SagaStep<DeployCtx> for PushStartScriptStep {
    async fn run(self: Box<Self>, ctx: DeployCtx) -> SovereignResult<()> {
        let remote = ctx.service.start_script();
        ctx.device.push_file(&ctx.local("start.sh"), &remote).await?;
        ctx.device.chmod_exec(&remote).await
    }

    fn name(&self) -> &'static str {
        "push_start_script"
    }
}

struct InstallWatchdogStep;

#[async_trait]
impl SagaStep<DeployCtx> for InstallWatchdogStep {
    async fn run(self: Box<Self>, ctx: DeployCtx) -> SovereignResult<()> {
        let mut installed = ctx.watchdog_installed.lock().await;
        if *installed {
            return Ok(());
        }

        match install_watchdog(&ctx).await {
            Ok(()) => {
                *installed = true;
                if let Ok(mut flag) = ctx.installed_watchdog.lock() {
                    *flag = true;
                }
                tracing::info!("Boot watchdog installed; guests auto-start at device boot");
            }
            Err(e) => tracing::warn!(error = %e, "Boot watchdog install failed"),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "install_watchdog"
    }
}

async fn install_watchdog(ctx: &DeployContext) -> SovereignResult<()> {
    let local = ctx.options.local_path(&ctx.options.local_watchdog_script);
    if !local.is_file() {
        return Err(SovereignError::MissingArtifact {
            service: ctx.service.name().to_string(),
            path: local.display().to_string(),
        });
    }

    let device = &ctx.options.device;
    let boot_copy = format!("{}/sovereign_start.sh", device.boot_service_dir);
    ctx.device.mkdir_p(&device.boot_service_dir).await?;
    ctx.device.push_file(&local, &boot_copy).await?;
    ctx.device.chmod_exec(&boot_copy).await?;

    ctx.device.mkdir_p(&device.root).await?;
    ctx.device.copy_file(&boot_copy, &device.daemon_script).await?;
    ctx.device.chmod_exec(&device.daemon_script).await
}
