//! In-memory state storage backend.
//!
//! Used for tests and single-process runs where durability is not needed.
//! Lease acquisition is atomic because the check and the insert happen
//! under one lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StateError};
use crate::reconciler::ReconciliationRun;
use crate::resource::ResourceKey;

use super::lease::Lease;
use super::store::StateStore;
use super::types::{AppliedRecord, ProjectState, MAX_RUN_HISTORY};

#[derive(Debug, Default)]
struct Inner {
    projects: HashMap<String, ProjectState>,
    leases: HashMap<String, Lease>,
    runs: HashMap<String, Vec<ReconciliationRun>>,
}

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, project: &str, key: &ResourceKey) -> Result<Option<AppliedRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.projects.get(project).and_then(|p| p.get(key)).cloned())
    }

    async fn put(&self, project: &str, record: &AppliedRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .projects
            .entry(project.to_string())
            .or_insert_with(|| ProjectState::new(project))
            .set(record.clone());
        Ok(())
    }

    async fn remove(&self, project: &str, key: &ResourceKey) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.projects.get_mut(project) {
            state.remove(key);
        }
        Ok(())
    }

    async fn list(&self, project: &str) -> Result<Vec<AppliedRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.projects.get(project).map(ProjectState::all).unwrap_or_default())
    }

    async fn acquire_lease(&self, project: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.leases.get(project) {
            if !existing.is_expired_at(now) {
                return Err(StateError::LeaseBusy {
                    project: project.to_string(),
                    holder: existing.holder.clone(),
                    expires_at: existing.expires_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lease for {project} held by {}, taking over", existing.holder);
        }

        let lease = Lease::new(project, holder, ttl, now);
        inner.leases.insert(project.to_string(), lease.clone());
        info!("Acquired lease {} for project {project}", lease.lease_id);
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        let mut inner = self.inner.lock().await;

        match inner.leases.get_mut(&lease.project) {
            Some(current) if current.same_acquisition(lease) => {
                *current = current.renewed(ttl, now);
                Ok(current.clone())
            }
            _ => Err(StateError::LeaseNotHeld {
                project: lease.project.clone(),
                lease_id: lease.lease_id.clone(),
            }
            .into()),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let held = inner
            .leases
            .get(&lease.project)
            .is_some_and(|current| current.same_acquisition(lease));

        if held {
            inner.leases.remove(&lease.project);
            info!("Released lease {} for project {}", lease.lease_id, lease.project);
        } else {
            debug!("Lease {} for {} no longer held, nothing to release", lease.lease_id, lease.project);
        }
        Ok(())
    }

    async fn current_lease(&self, project: &str) -> Result<Option<Lease>> {
        let inner = self.inner.lock().await;
        Ok(inner.leases.get(project).cloned())
    }

    async fn force_release_lease(&self, project: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.leases.remove(project).is_some())
    }

    async fn append_run(&self, run: &ReconciliationRun) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let runs = inner.runs.entry(run.project_id.clone()).or_default();
        runs.push(run.clone());
        if runs.len() > MAX_RUN_HISTORY {
            let excess = runs.len() - MAX_RUN_HISTORY;
            runs.drain(..excess);
        }
        Ok(())
    }

    async fn recent_runs(&self, project: &str, limit: usize) -> Result<Vec<ReconciliationRun>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .get(project)
            .map(|runs| runs.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
