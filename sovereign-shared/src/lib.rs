//! Types shared between the sovereign orchestrator crates.

pub mod errors;

pub use errors::{SovereignError, SovereignResult};
