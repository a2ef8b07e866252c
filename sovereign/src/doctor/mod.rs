//! Diagnose, fix and verify guests.
//!
//! Diagnosis is read-only. Fix applies bounded remediations that each
//! re-check their own postcondition; none of them discards guest data.

mod diagnose;
mod fix;
mod verify;

pub use diagnose::{CheckResult, CheckStatus, DiagnosisReport, InfrastructureReport};
pub use fix::{FixReport, FixResult};
pub use verify::{TestReport, TestResult};

use crate::lifecycle::LifecycleController;
use crate::network::LinkState;
use crate::service::ServiceDescriptor;
use sovereign_shared::errors::{SovereignError, SovereignResult};

/// Longest console line kept in a report.
const MAX_LINE_CHARS: usize = 100;

/// Console text left by a guest that could not log in to the database.
const DB_AUTH_FAILURE: &str = "password authentication failed";

pub struct Doctor<'a> {
    controller: &'a LifecycleController,
}

impl<'a> Doctor<'a> {
    pub fn new(controller: &'a LifecycleController) -> Self {
        Self { controller }
    }

    /// Live state of a guest's TAP interface, `None` when it does not exist.
    async fn tap_state(&self, service: &ServiceDescriptor) -> Option<LinkState> {
        let out = self
            .controller
            .device()
            .link_show(&service.network().tap)
            .await
            .ok()
            .flatten()?;
        LinkState::parse(&out)
    }

    async fn ensure_connected(&self) -> SovereignResult<()> {
        if self.controller.device().is_connected().await {
            Ok(())
        } else {
            Err(SovereignError::Device("no device connected".into()))
        }
    }
}

fn truncate_line(line: &str) -> String {
    match line.char_indices().nth(MAX_LINE_CHARS) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}
