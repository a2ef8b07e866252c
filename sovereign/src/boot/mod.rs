//! Boot readiness detection.
//!
//! ```text
//! BOOTING ──kernel marker──▶ KERNEL_UP ──ready marker──▶ READY
//!    │                           │
//!    ├── fatal marker / process gone after grace ──▶ FAILED
//!    └── elapsed > start timeout ──────────────────▶ TIMEOUT
//! ```

mod monitor;
mod rules;

pub use monitor::{BootMonitor, BootPhase, BootReport, BootSettings, LogCursor};
pub use rules::{FALLBACK_READY_MARKER, LogClass, LogPattern, LogRule, RuleTable};
