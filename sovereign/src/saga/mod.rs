//! Staged step execution for multi-step lifecycle operations.
//!
//! ```text
//! Saga → Stages → Steps
//!
//! - Saga: named, ordered list of stages; first failing step aborts the rest
//! - Stage: steps run concurrently or one after another
//! - Step: one side effect against the device or local filesystem
//! ```
//!
//! Completed steps are not rolled back. Every step is written so re-running
//! the whole saga after a failure converges.

mod metrics;
mod runner;
mod stage;
mod step;

pub use metrics::{SagaMetrics, StageMetrics, StepMetrics};
pub use runner::{Saga, SagaRunner};
pub use stage::{Stage, StageMode};
pub use step::{BoxedStep, SagaStep};
