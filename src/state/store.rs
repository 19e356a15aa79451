//! State store trait definition.
//!
//! This module defines the contract every persistence backend implements:
//! per-resource records, per-project leases with compare-and-swap acquisition,
//! and a bounded history of sealed runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::reconciler::ReconciliationRun;
use crate::resource::ResourceKey;

use super::lease::Lease;
use super::types::AppliedRecord;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the record for a resource.
    ///
    /// Returns `None` if the resource was never attempted or has been removed.
    async fn get(&self, project: &str, key: &ResourceKey) -> Result<Option<AppliedRecord>>;

    /// Stores a record, replacing any previous one for the same key.
    async fn put(&self, project: &str, record: &AppliedRecord) -> Result<()>;

    /// Removes the record for a resource. Removing a missing record is not an error.
    async fn remove(&self, project: &str, key: &ResourceKey) -> Result<()>;

    /// Lists all records of a project in key order.
    async fn list(&self, project: &str) -> Result<Vec<AppliedRecord>>;

    /// Atomically acquires the project lease, expiring `ttl` after `now`.
    ///
    /// Fails with `StateError::LeaseBusy` when a lease unexpired at `now` exists.
    /// Taking over an expired lease is a compare-and-swap against the expired
    /// value: of several concurrent callers, exactly one wins.
    async fn acquire_lease(&self, project: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Lease>;

    /// Extends a held lease to expire `ttl` after `now`.
    ///
    /// Fails with `StateError::LeaseNotHeld` if the lease was released or taken over.
    async fn renew_lease(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Lease>;

    /// Releases a held lease. Releasing a lease that is no longer held is a no-op.
    async fn release_lease(&self, lease: &Lease) -> Result<()>;

    /// Returns the stored lease for a project, expired or not.
    async fn current_lease(&self, project: &str) -> Result<Option<Lease>>;

    /// Removes the project lease regardless of holder.
    ///
    /// Returns true if a lease was removed.
    async fn force_release_lease(&self, project: &str) -> Result<bool>;

    /// Appends a sealed run to the project history.
    async fn append_run(&self, run: &ReconciliationRun) -> Result<()>;

    /// Returns up to `limit` most recent runs, newest first.
    async fn recent_runs(&self, project: &str, limit: usize) -> Result<Vec<ReconciliationRun>>;

    /// Flushes buffered state before shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn get(&self, project: &str, key: &ResourceKey) -> Result<Option<AppliedRecord>> {
        (**self).get(project, key).await
    }

    async fn put(&self, project: &str, record: &AppliedRecord) -> Result<()> {
        (**self).put(project, record).await
    }

    async fn remove(&self, project: &str, key: &ResourceKey) -> Result<()> {
        (**self).remove(project, key).await
    }

    async fn list(&self, project: &str) -> Result<Vec<AppliedRecord>> {
        (**self).list(project).await
    }

    async fn acquire_lease(&self, project: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        (**self).acquire_lease(project, holder, ttl, now).await
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        (**self).renew_lease(lease, ttl, now).await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        (**self).release_lease(lease).await
    }

    async fn current_lease(&self, project: &str) -> Result<Option<Lease>> {
        (**self).current_lease(project).await
    }

    async fn force_release_lease(&self, project: &str) -> Result<bool> {
        (**self).force_release_lease(project).await
    }

    async fn append_run(&self, run: &ReconciliationRun) -> Result<()> {
        (**self).append_run(run).await
    }

    async fn recent_runs(&self, project: &str, limit: usize) -> Result<Vec<ReconciliationRun>> {
        (**self).recent_runs(project, limit).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// Rejects project identifiers that cannot be used as a storage path segment.
pub(crate) fn validate_project_segment(project: &str) -> Result<()> {
    let valid = !project.is_empty()
        && project != "."
        && project != ".."
        && project
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(crate::error::StateError::unavailable(format!("Invalid project identifier for storage: '{project}'")).into())
    }
}
