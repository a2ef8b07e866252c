use super::{LifecycleController, StopOutcome};
use crate::identity::RemovalReport;
use crate::service::ServiceDescriptor;
use sovereign_shared::errors::{SovereignError, SovereignResult};

#[derive(Debug, Clone)]
pub struct RemoveReport {
    pub stop: StopOutcome,
    /// `None` when registration cleanup failed and was downgraded.
    pub registrations: Option<RemovalReport>,
}

/// Stop, drop identity registrations, then delete the guest directory.
pub(super) async fn remove(
    controller: &LifecycleController,
    service: &ServiceDescriptor,
) -> SovereignResult<RemoveReport> {
    let name = service.name();
    let stop = controller.stop(service).await?;

    let registrations = match controller
        .identity()
        .remove_registrations(service.identity_host())
        .await
    {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::warn!(service = name, error = %e, "Could not remove identity registrations");
            None
        }
    };

    let path = service.device_path();
    let device = controller.device();
    device.remove_dir_all(path).await?;
    if device.dir_exists(path).await? {
        return Err(SovereignError::DirectoryRemovalFailed {
            service: name.to_string(),
            path: path.to_string(),
        });
    }

    tracing::info!(service = name, path, "Removed");
    tracing::info!("To redeploy: sovereign deploy --{}", name);
    Ok(RemoveReport {
        stop,
        registrations,
    })
}
