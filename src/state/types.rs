//! Persisted reconciliation state.
//!
//! An [`AppliedRecord`] is the system's own memory of what it last applied for
//! one resource. Planning diffs against these records, never against live state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resource::{ResourceKey, ResourceKind};

/// Current version of the persisted state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of sealed runs kept per project.
pub const MAX_RUN_HISTORY: usize = 100;

/// Status of an applied record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// A driver call is in flight or was interrupted; live state is unknown.
    Pending,
    /// The checksum was applied successfully.
    Applied,
    /// The last attempt failed.
    Failed,
}

/// Last-known-applied state of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecord {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource identity.
    pub identity: String,
    /// Checksum of the last successfully applied configuration.
    ///
    /// Never the checksum of an in-flight or failed configuration.
    pub checksum: Option<String>,
    /// Monotonic counter, incremented before every attempt.
    pub generation: u64,
    /// When the resource was last applied successfully.
    pub last_applied_at: Option<DateTime<Utc>>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// Current status.
    pub status: RecordStatus,
    /// Provider handle returned by the last successful call.
    #[serde(default)]
    pub provider_id: Option<String>,
}

impl AppliedRecord {
    /// Returns the pending checkpoint written before a driver call.
    ///
    /// The previous checksum, success timestamp and provider handle carry over.
    #[must_use]
    pub fn pending(key: &ResourceKey, previous: Option<&Self>, now: DateTime<Utc>) -> Self {
        match previous {
            Some(prev) => Self {
                generation: prev.generation + 1,
                status: RecordStatus::Pending,
                updated_at: now,
                ..prev.clone()
            },
            None => Self {
                kind: key.kind,
                identity: key.identity.clone(),
                checksum: None,
                generation: 1,
                last_applied_at: None,
                updated_at: now,
                status: RecordStatus::Pending,
                provider_id: None,
            },
        }
    }

    /// Marks the record applied with the given checksum.
    #[must_use]
    pub fn applied(self, checksum: &str, provider_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            checksum: Some(checksum.to_string()),
            last_applied_at: Some(now),
            updated_at: now,
            status: RecordStatus::Applied,
            provider_id: provider_id.or(self.provider_id),
            ..self
        }
    }

    /// Marks the record failed, keeping the last successful checksum.
    #[must_use]
    pub fn failed(self, now: DateTime<Utc>) -> Self {
        Self {
            updated_at: now,
            status: RecordStatus::Failed,
            ..self
        }
    }

    /// Key of the resource this record describes.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind, self.identity.clone())
    }

    /// Returns true if `checksum` is already applied and nothing needs to run.
    #[must_use]
    pub fn is_satisfied_by(&self, checksum: &str) -> bool {
        self.status == RecordStatus::Applied && self.checksum.as_deref() == Some(checksum)
    }
}

/// All records of one project, as stored by file-based backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    /// State format version.
    pub version: String,
    /// Project identifier.
    pub project: String,
    /// Records keyed by `kind/identity`.
    pub records: BTreeMap<String, AppliedRecord>,
    /// When the document was last written.
    pub last_updated: DateTime<Utc>,
}

impl ProjectState {
    /// Creates an empty project state.
    #[must_use]
    pub fn new(project: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            records: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    /// Gets a record by key.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&AppliedRecord> {
        self.records.get(&key.to_string())
    }

    /// Adds or replaces a record.
    pub fn set(&mut self, record: AppliedRecord) {
        self.records.insert(record.key().to_string(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record, returning it if present.
    pub fn remove(&mut self, key: &ResourceKey) -> Option<AppliedRecord> {
        let removed = self.records.remove(&key.to_string());
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Returns all records in key order.
    #[must_use]
    pub fn all(&self) -> Vec<AppliedRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        records
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
        };
        write!(f, "{status}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ResourceKey {
        ResourceKey::new(ResourceKind::ServiceDeployment, "api")
    }

    #[test]
    fn test_pending_first_attempt() {
        let now = Utc::now();
        let rec = AppliedRecord::pending(&key(), None, now);

        assert_eq!(rec.generation, 1);
        assert_eq!(rec.status, RecordStatus::Pending);
        assert!(rec.checksum.is_none());
        assert!(!rec.is_satisfied_by("abc"));
    }

    #[test]
    fn test_lifecycle_keeps_last_success() {
        let now = Utc::now();
        let applied = AppliedRecord::pending(&key(), None, now).applied("v1", Some("svc-1".into()), now);
        assert!(applied.is_satisfied_by("v1"));
        assert_eq!(applied.provider_id.as_deref(), Some("svc-1"));

        let retry = AppliedRecord::pending(&key(), Some(&applied), now);
        assert_eq!(retry.generation, 2);
        assert_eq!(retry.checksum.as_deref(), Some("v1"));
        assert!(!retry.is_satisfied_by("v1"));

        let failed = retry.failed(now);
        assert_eq!(failed.status, RecordStatus::Failed);
        assert_eq!(failed.checksum.as_deref(), Some("v1"));
        assert_eq!(failed.provider_id.as_deref(), Some("svc-1"));
    }

    #[test]
    fn test_project_state_ordering() {
        let now = Utc::now();
        let mut state = ProjectState::new("p1");
        state.set(AppliedRecord::pending(&key(), None, now));
        state.set(AppliedRecord::pending(
            &ResourceKey::new(ResourceKind::Project, "p1"),
            None,
            now,
        ));

        let kinds: Vec<_> = state.all().into_iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ResourceKind::Project, ResourceKind::ServiceDeployment]);

        assert!(state.remove(&key()).is_some());
        assert!(state.get(&key()).is_none());
    }
}
