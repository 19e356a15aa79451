//! Plan types.
//!
//! A [`Plan`] is a value object owned by a single reconciliation run. It holds
//! at most one operation per resource key, ordered so that every operation
//! comes after everything it depends on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::resource::{ConfigHasher, ResourceDescriptor, ResourceKey, ResourceKind};

/// What an operation does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// The resource has never been applied.
    Create,
    /// The resource exists with a different checksum.
    Update,
    /// The resource was explicitly marked for removal.
    Delete,
    /// The applied checksum already matches; nothing to execute.
    NoOp,
}

impl Action {
    /// Symbol used when rendering plans.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => "=",
        }
    }
}

/// One step of a plan.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Desired resource. Empty configuration for deletes.
    pub descriptor: ResourceDescriptor,
    /// Action to perform.
    pub action: Action,
    /// Keys of earlier operations in the same plan that must succeed first.
    pub depends_on: BTreeSet<ResourceKey>,
    /// Checksum recorded by the last successful apply, if any.
    pub previous_checksum: Option<String>,
}

impl Operation {
    /// Key of the resource this operation touches.
    #[must_use]
    pub const fn key(&self) -> &ResourceKey {
        self.descriptor.key()
    }

    /// Resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.descriptor.kind()
    }

    /// Resource identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        self.descriptor.identity()
    }
}

/// Counts of actions in a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Number of creates.
    pub create: usize,
    /// Number of updates.
    pub update: usize,
    /// Number of deletes.
    pub delete: usize,
    /// Number of descriptors already applied.
    pub unchanged: usize,
}

/// An ordered set of operations for one project.
#[derive(Debug, Clone)]
pub struct Plan {
    plan_id: Uuid,
    project_id: String,
    created_at: DateTime<Utc>,
    operations: Vec<Operation>,
    unchanged: Vec<ResourceKey>,
}

impl Plan {
    /// Assembles a plan from already ordered operations.
    #[must_use]
    pub(crate) fn new(project_id: &str, operations: Vec<Operation>, unchanged: Vec<ResourceKey>) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            created_at: Utc::now(),
            operations,
            unchanged,
        }
    }

    /// Unique plan identifier.
    #[must_use]
    pub const fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    /// Project the plan targets.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// When the plan was built.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Operations in execution order. Never contains `NoOp`.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Keys of desired resources whose applied checksum already matches.
    #[must_use]
    pub fn unchanged(&self) -> &[ResourceKey] {
        &self.unchanged
    }

    /// Finds the operation for a key.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&Operation> {
        self.operations.iter().find(|op| op.key() == key)
    }

    /// Returns true if nothing needs to be executed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of operations to execute.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Counts actions by type.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary {
            unchanged: self.unchanged.len(),
            ..PlanSummary::default()
        };
        for op in &self.operations {
            match op.action {
                Action::Create => summary.create += 1,
                Action::Update => summary.update += 1,
                Action::Delete => summary.delete += 1,
                Action::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let action = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{action}")
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.unchanged
        )
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Plan {} for project {}", self.plan_id, self.project_id)?;
        if self.operations.is_empty() {
            writeln!(f, "  No changes. Everything is up to date.")?;
        }
        for op in &self.operations {
            write!(f, "  {} {} {}", op.action.symbol(), op.action, op.key())?;
            if op.action != Action::Delete {
                write!(f, " [{}]", ConfigHasher::short_hash(op.descriptor.checksum()))?;
            }
            writeln!(f)?;
        }
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: ResourceKind, identity: &str, action: Action) -> Operation {
        let descriptor = match action {
            Action::Delete => ResourceDescriptor::tombstone(&ResourceKey::new(kind, identity)),
            _ => ResourceDescriptor::builder(kind, identity).set("region", "us-central1").build(),
        };
        Operation {
            descriptor,
            action,
            depends_on: BTreeSet::new(),
            previous_checksum: None,
        }
    }

    #[test]
    fn test_summary_counts_actions_and_unchanged() {
        let plan = Plan::new(
            "p1",
            vec![
                op(ResourceKind::Project, "p1", Action::Create),
                op(ResourceKind::ServiceDeployment, "api", Action::Update),
                op(ResourceKind::Topic, "old", Action::Delete),
            ],
            vec![ResourceKey::new(ResourceKind::IamBinding, "owner")],
        );

        let summary = plan.summary();
        assert_eq!((summary.create, summary.update, summary.delete, summary.unchanged), (1, 1, 1, 1));
        assert_eq!(summary.to_string(), "1 to create, 1 to update, 1 to delete, 1 unchanged");
        assert_eq!(plan.len(), 3);
        assert!(plan.get(&ResourceKey::new(ResourceKind::Topic, "old")).is_some());
    }

    #[test]
    fn test_display_lists_operations_in_order() {
        let plan = Plan::new(
            "p1",
            vec![
                op(ResourceKind::Project, "p1", Action::Create),
                op(ResourceKind::Topic, "old", Action::Delete),
            ],
            Vec::new(),
        );

        let rendered = plan.to_string();
        let create = rendered.find("+ create project/p1 [").unwrap();
        let delete = rendered.find("- delete topic/old").unwrap();
        assert!(create < delete);
        assert!(!rendered.contains("topic/old ["));
    }

    #[test]
    fn test_empty_plan_renders_up_to_date() {
        let plan = Plan::new("p1", Vec::new(), Vec::new());
        assert!(plan.is_empty());
        assert!(plan.to_string().contains("No changes"));
    }
}
