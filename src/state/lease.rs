//! Per-project exclusive leases.
//!
//! A lease carries an expiry so a crashed holder never blocks a project
//! forever: once expired, any caller may reclaim it. Times are always passed
//! in so that expiry follows the reconciler's clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Default lease time-to-live in seconds.
pub const DEFAULT_LEASE_TTL_SECS: u64 = 300;

/// A held or observed project lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Unique lease identifier, changes on every acquisition.
    pub lease_id: String,
    /// Project guarded by the lease.
    pub project: String,
    /// Who holds the lease.
    pub holder: String,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease expires unless renewed.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Creates a fresh lease starting at `now`.
    #[must_use]
    pub fn new(project: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            lease_id: Uuid::new_v4().to_string(),
            project: project.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + to_chrono(ttl),
        }
    }

    /// Checks if the lease has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns the same lease expiring `ttl` after `now`.
    #[must_use]
    pub fn renewed(&self, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            expires_at: now + to_chrono(ttl),
            ..self.clone()
        }
    }

    /// Returns true if `other` is the same acquisition as `self`.
    #[must_use]
    pub fn same_acquisition(&self, other: &Self) -> bool {
        self.lease_id == other.lease_id && self.project == other.project
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs_at(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

impl std::fmt::Display for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} held by {} until {}",
            self.project,
            self.holder,
            self.expires_at.to_rfc3339()
        )
    }
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}
