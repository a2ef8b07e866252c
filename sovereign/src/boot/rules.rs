//! Ordered console classification rules.

use crate::service::ServiceDescriptor;
use regex::Regex;
use sovereign_shared::errors::{SovereignError, SovereignResult};

/// Readiness marker every guest init prints when it has nothing more specific.
pub const FALLBACK_READY_MARKER: &str = "INIT COMPLETE";

/// What a console line says about the boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogClass {
    KernelUp,
    Ready,
    Fatal,
}

#[derive(Debug, Clone)]
pub enum LogPattern {
    Contains(String),
    Regex(Regex),
}

impl LogPattern {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            LogPattern::Contains(needle) => line.contains(needle.as_str()),
            LogPattern::Regex(re) => re.is_match(line),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogRule {
    pub pattern: LogPattern,
    pub class: LogClass,
}

impl LogRule {
    pub fn contains(needle: impl Into<String>, class: LogClass) -> Self {
        Self {
            pattern: LogPattern::Contains(needle.into()),
            class,
        }
    }

    pub fn regex(pattern: &str, class: LogClass) -> SovereignResult<Self> {
        let re = Regex::new(pattern).map_err(|e| {
            SovereignError::InvalidArgument(format!("invalid log rule {:?}: {}", pattern, e))
        })?;
        Ok(Self {
            pattern: LogPattern::Regex(re),
            class,
        })
    }
}

/// First matching rule wins.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<LogRule>,
}

impl RuleTable {
    pub fn new(rules: Vec<LogRule>) -> Self {
        Self { rules }
    }

    /// Service rules, then its marker, then the built-in markers.
    pub fn for_service(service: &ServiceDescriptor) -> Self {
        let mut rules = service.log_rules().to_vec();
        rules.push(LogRule::contains(service.ready_marker(), LogClass::Ready));
        if service.ready_marker() != FALLBACK_READY_MARKER {
            rules.push(LogRule::contains(FALLBACK_READY_MARKER, LogClass::Ready));
        }
        rules.push(LogRule::contains("Run /sbin/simple_init", LogClass::KernelUp));
        rules.push(LogRule::contains("Kernel panic", LogClass::Fatal));
        rules.push(LogRule::contains("FATAL", LogClass::Fatal));
        Self { rules }
    }

    pub fn classify(&self, line: &str) -> Option<LogClass> {
        self.rules
            .iter()
            .find(|r| r.pattern.matches(line))
            .map(|r| r.class)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
