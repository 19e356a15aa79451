//! Drift inspection report.
//!
//! Diagnostic only. Planning never reads live state.

use serde::Serialize;

use crate::resource::ResourceKey;

/// Live state observed for one applied resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DriftState {
    /// The provider still knows the resource.
    Present {
        /// Provider identifier reported by the driver.
        provider_id: String,
    },
    /// The provider no longer has the resource.
    Missing,
    /// The provider could not be asked.
    Unreachable {
        /// Driver error.
        message: String,
    },
}

/// One inspected resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftEntry {
    /// Resource inspected.
    pub key: ResourceKey,
    /// What the driver reported.
    #[serde(flatten)]
    pub state: DriftState,
}

/// Result of comparing applied records with live state.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Project inspected.
    pub project_id: String,
    /// One entry per applied record, in key order.
    pub entries: Vec<DriftEntry>,
}

impl DriftReport {
    /// Returns true if any applied resource is missing on the provider side.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.entries.iter().any(|e| e.state == DriftState::Missing)
    }

    /// Entries whose live state could not be read.
    pub fn unreachable(&self) -> impl Iterator<Item = &DriftEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, DriftState::Unreachable { .. }))
    }
}

impl std::fmt::Display for DriftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Present { provider_id } => write!(f, "present ({provider_id})"),
            Self::Missing => write!(f, "missing"),
            Self::Unreachable { message } => write!(f, "unreachable: {message}"),
        }
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Drift report for {}", self.project_id)?;
        if self.entries.is_empty() {
            return writeln!(f, "  no applied resources");
        }
        for entry in &self.entries {
            writeln!(f, "  {}: {}", entry.key, entry.state)?;
        }
        Ok(())
    }
}
