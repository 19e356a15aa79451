//! Plan construction.
//!
//! Diffs desired descriptors against the applied records in the state store.
//! Live provider state is never consulted: the system reconciles against its
//! own last-applied intent.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::error::{PlanError, Result};
use crate::resource::{RemovalMarker, ResourceDescriptor, ResourceKey, ResourceKind};
use crate::state::StateStore;

use super::plan::{Action, Operation, Plan};

/// Builds plans for one project at a time.
#[derive(Debug)]
pub struct PlanBuilder<'a, S: StateStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: StateStore + ?Sized> PlanBuilder<'a, S> {
    /// Creates a plan builder reading applied records from `store`.
    #[must_use]
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Builds the plan moving `project_id` from its applied records to `desired`.
    ///
    /// Resources are deleted only when named by a removal marker.
    ///
    /// # Errors
    ///
    /// Returns `DescriptorConflict` for two different descriptors with one key or
    /// a descriptor that is also marked for removal, `UnresolvedDependency` when a
    /// required predecessor kind is absent, and state errors from the store.
    pub async fn build_plan(
        &self,
        project_id: &str,
        desired: &[ResourceDescriptor],
        removals: &[RemovalMarker],
    ) -> Result<Plan> {
        let desired = dedupe(desired)?;
        check_required_predecessors(&desired)?;
        let removals = check_removals(&desired, removals)?;

        let mut forward = Vec::new();
        let mut unchanged = Vec::new();

        for (key, descriptor) in &desired {
            let record = self.store.get(project_id, key).await?;
            let action = match &record {
                None => Action::Create,
                Some(r) if r.is_satisfied_by(descriptor.checksum()) => Action::NoOp,
                Some(r) if r.checksum.is_some() => Action::Update,
                Some(_) => Action::Create,
            };
            debug!("Planned {action} for {key}");

            if action == Action::NoOp {
                unchanged.push(key.clone());
                continue;
            }
            forward.push(Operation {
                descriptor: descriptor.clone(),
                action,
                depends_on: BTreeSet::new(),
                previous_checksum: record.and_then(|r| r.checksum),
            });
        }

        let mut deletes = Vec::new();
        for key in &removals {
            match self.store.get(project_id, key).await? {
                Some(record) => deletes.push(Operation {
                    descriptor: ResourceDescriptor::tombstone(key),
                    action: Action::Delete,
                    depends_on: BTreeSet::new(),
                    previous_checksum: record.checksum,
                }),
                None => debug!("No applied record for {key}, nothing to delete"),
            }
        }

        let operations = order(forward, deletes);
        let plan = Plan::new(project_id, operations, unchanged);
        info!("Built plan {} for {project_id}: {}", plan.plan_id(), plan.summary());
        Ok(plan)
    }
}

/// Collapses identical duplicates; rejects differing ones.
fn dedupe(desired: &[ResourceDescriptor]) -> Result<BTreeMap<ResourceKey, ResourceDescriptor>> {
    let mut by_key: BTreeMap<ResourceKey, ResourceDescriptor> = BTreeMap::new();

    for descriptor in desired {
        match by_key.get(descriptor.key()) {
            Some(existing) if existing.checksum() != descriptor.checksum() => {
                return Err(PlanError::DescriptorConflict {
                    kind: descriptor.kind(),
                    identity: descriptor.identity().to_string(),
                    message: String::from("declared twice with different configuration"),
                }
                .into());
            }
            Some(_) => {}
            None => {
                by_key.insert(descriptor.key().clone(), descriptor.clone());
            }
        }
    }

    Ok(by_key)
}

fn check_required_predecessors(desired: &BTreeMap<ResourceKey, ResourceDescriptor>) -> Result<()> {
    let present: BTreeSet<ResourceKind> = desired.keys().map(|k| k.kind).collect();

    for key in desired.keys() {
        if let Some(missing) = key
            .kind
            .required_predecessors()
            .iter()
            .find(|req| !present.contains(*req))
        {
            return Err(PlanError::UnresolvedDependency {
                kind: key.kind,
                identity: key.identity.clone(),
                missing: *missing,
            }
            .into());
        }
    }

    Ok(())
}

fn check_removals(
    desired: &BTreeMap<ResourceKey, ResourceDescriptor>,
    removals: &[RemovalMarker],
) -> Result<BTreeSet<ResourceKey>> {
    let mut keys = BTreeSet::new();
    for marker in removals {
        if desired.contains_key(&marker.key) {
            return Err(PlanError::DescriptorConflict {
                kind: marker.key.kind,
                identity: marker.key.identity.clone(),
                message: String::from("marked for removal but still desired"),
            }
            .into());
        }
        keys.insert(marker.key.clone());
    }
    Ok(keys)
}

/// Orders creates and updates by kind order then identity, followed by deletes
/// with descendants first, and fills in `depends_on`.
fn order(mut forward: Vec<Operation>, mut deletes: Vec<Operation>) -> Vec<Operation> {
    forward.sort_by(|a, b| a.key().cmp(b.key()));
    deletes.sort_by(|a, b| b.kind().cmp(&a.kind()).then_with(|| a.identity().cmp(b.identity())));

    let forward_keys: Vec<ResourceKey> = forward.iter().map(|op| op.key().clone()).collect();
    for op in &mut forward {
        let kind = op.kind();
        op.depends_on = forward_keys
            .iter()
            .filter(|k| k.kind.is_ancestor_of(kind))
            .cloned()
            .collect();
    }

    let delete_keys: Vec<ResourceKey> = deletes.iter().map(|op| op.key().clone()).collect();
    for op in &mut deletes {
        let kind = op.kind();
        op.depends_on = delete_keys
            .iter()
            .filter(|k| kind.is_ancestor_of(k.kind))
            .cloned()
            .collect();
    }

    forward.extend(deletes);
    forward
}
