//! Reconciliation run records.
//!
//! A [`RunRecorder`] is appended to while a plan executes and sealed into an
//! immutable [`ReconciliationRun`] when execution ends, whatever the result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureClass;
use crate::planner::{Action, Operation, Plan};
use crate::resource::{ResourceKey, ResourceKind};

/// Why an operation was not attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// An operation it depends on failed or was skipped.
    DependencyFailed {
        /// The blocking operation.
        upstream: ResourceKey,
    },
    /// The run lost its project lease.
    LeaseLost,
    /// The run was cancelled.
    Cancelled,
    /// The run deadline passed before the operation started.
    DeadlineExceeded,
}

/// Result of one plan entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The driver call succeeded and the record was persisted.
    Applied {
        /// Provider handle, if the driver returned one.
        provider_id: Option<String>,
        /// Number of driver attempts.
        attempts: u32,
    },
    /// Already applied with a matching checksum; nothing was executed.
    Unchanged,
    /// The operation failed.
    Failed {
        /// Failure classification.
        class: FailureClass,
        /// Error message.
        message: String,
        /// Number of driver attempts.
        attempts: u32,
    },
    /// The operation was never attempted.
    Skipped {
        /// Why it was skipped.
        #[serde(flatten)]
        reason: SkipReason,
    },
}

impl Outcome {
    /// Returns true if the resource is converged after this outcome.
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        matches!(self, Self::Applied { .. } | Self::Unchanged)
    }

    /// Short label for tables.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Unchanged => "unchanged",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every entry converged.
    Succeeded,
    /// Some entries converged, others failed or were skipped.
    PartiallyFailed,
    /// Nothing converged.
    Failed,
    /// The request never started a run.
    Rejected,
}

/// One entry of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEntry {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource identity.
    pub identity: String,
    /// Planned action.
    pub action: Action,
    /// Checksum of the desired configuration. `None` for deletes.
    pub checksum: Option<String>,
    /// What happened.
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl RunEntry {
    /// Key of the resource.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind, self.identity.clone())
    }
}

/// Sealed audit record of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    /// Project reconciled.
    pub project_id: String,
    /// Plan executed.
    pub plan_id: Uuid,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When the run was sealed.
    pub finished_at: DateTime<Utc>,
    /// Final status.
    pub status: RunStatus,
    /// Entries in the order they were recorded.
    pub entries: Vec<RunEntry>,
}

impl ReconciliationRun {
    /// Finds the entry for a resource.
    #[must_use]
    pub fn entry(&self, key: &ResourceKey) -> Option<&RunEntry> {
        self.entries.iter().find(|e| e.kind == key.kind && e.identity == key.identity)
    }

    /// Number of entries with the given outcome label.
    #[must_use]
    pub fn count(&self, label: &str) -> usize {
        self.entries.iter().filter(|e| e.outcome.label() == label).count()
    }

    /// Returns true if the run converged every entry.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Append-only builder for a run.
#[derive(Debug)]
pub struct RunRecorder {
    project_id: String,
    plan_id: Uuid,
    started_at: DateTime<Utc>,
    entries: Vec<RunEntry>,
}

impl RunRecorder {
    /// Starts recording the execution of `plan`.
    #[must_use]
    pub fn start(plan: &Plan, started_at: DateTime<Utc>) -> Self {
        Self {
            project_id: plan.project_id().to_string(),
            plan_id: plan.plan_id(),
            started_at,
            entries: Vec::with_capacity(plan.len() + plan.unchanged().len()),
        }
    }

    /// Records a desired resource that needed no work.
    pub fn unchanged(&mut self, key: &ResourceKey) {
        self.entries.push(RunEntry {
            kind: key.kind,
            identity: key.identity.clone(),
            action: Action::NoOp,
            checksum: None,
            outcome: Outcome::Unchanged,
        });
    }

    /// Records the outcome of an operation.
    pub fn record(&mut self, op: &Operation, outcome: Outcome) {
        let checksum = (op.action != Action::Delete).then(|| op.descriptor.checksum().to_string());
        self.entries.push(RunEntry {
            kind: op.kind(),
            identity: op.identity().to_string(),
            action: op.action,
            checksum,
            outcome,
        });
    }

    /// Records an operation that was not attempted.
    pub fn skip(&mut self, op: &Operation, reason: SkipReason) {
        self.record(op, Outcome::Skipped { reason });
    }

    /// Seals the run and derives its status.
    #[must_use]
    pub fn seal(self, finished_at: DateTime<Utc>) -> ReconciliationRun {
        let converged = self.entries.iter().filter(|e| e.outcome.is_converged()).count();
        let status = if converged == self.entries.len() {
            RunStatus::Succeeded
        } else if converged == 0 {
            RunStatus::Failed
        } else {
            RunStatus::PartiallyFailed
        };

        ReconciliationRun {
            project_id: self.project_id,
            plan_id: self.plan_id,
            started_at: self.started_at,
            finished_at,
            status,
            entries: self.entries,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Succeeded => "succeeded",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DependencyFailed { upstream } => write!(f, "dependency {upstream} did not converge"),
            Self::LeaseLost => write!(f, "lease lost"),
            Self::Cancelled => write!(f, "run cancelled"),
            Self::DeadlineExceeded => write!(f, "run deadline exceeded"),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied { attempts, .. } if *attempts > 1 => write!(f, "applied after {attempts} attempts"),
            Self::Applied { .. } => write!(f, "applied"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed { class, message, .. } => write!(f, "failed ({class}): {message}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

impl std::fmt::Display for ReconciliationRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Run {} for project {}: {}",
            self.plan_id, self.project_id, self.status
        )?;
        for entry in &self.entries {
            writeln!(
                f,
                "  {} {}/{}: {}",
                entry.action.symbol(),
                entry.kind,
                entry.identity,
                entry.outcome
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(outcome: Outcome) -> RunEntry {
        RunEntry {
            kind: ResourceKind::Topic,
            identity: String::from("events"),
            action: Action::Create,
            checksum: Some(String::from("abc")),
            outcome,
        }
    }

    fn sealed(outcomes: Vec<Outcome>) -> ReconciliationRun {
        RunRecorder {
            project_id: String::from("p1"),
            plan_id: Uuid::new_v4(),
            started_at: Utc::now(),
            entries: outcomes.into_iter().map(entry).collect(),
        }
        .seal(Utc::now())
    }

    fn failed() -> Outcome {
        Outcome::Failed {
            class: FailureClass::Permanent,
            message: String::from("quota"),
            attempts: 1,
        }
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(sealed(vec![]).status, RunStatus::Succeeded);
        assert_eq!(sealed(vec![Outcome::Unchanged]).status, RunStatus::Succeeded);
        assert_eq!(sealed(vec![failed()]).status, RunStatus::Failed);
        assert_eq!(
            sealed(vec![
                Outcome::Applied {
                    provider_id: None,
                    attempts: 1
                },
                failed()
            ])
            .status,
            RunStatus::PartiallyFailed
        );
        assert_eq!(
            sealed(vec![Outcome::Skipped {
                reason: SkipReason::LeaseLost
            }])
            .status,
            RunStatus::Failed
        );
    }

    #[test]
    fn test_run_json_shape() {
        let run = sealed(vec![Outcome::Skipped {
            reason: SkipReason::DependencyFailed {
                upstream: ResourceKey::new(ResourceKind::IamBinding, "owner"),
            },
        }]);

        let json = serde_json::to_value(&run).expect("serialize");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["entries"][0]["outcome"], "skipped");
        assert_eq!(json["entries"][0]["reason"], "dependency_failed");
        assert_eq!(json["entries"][0]["upstream"]["identity"], "owner");

        let back: ReconciliationRun = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, run);
    }
}
