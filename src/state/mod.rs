//! State management module.
//!
//! This module persists what the reconciler last applied for every resource,
//! the per-project leases that serialize runs, and the history of sealed runs.

mod lease;
mod local;
mod memory;
mod s3;
mod store;
mod types;

pub use lease::{DEFAULT_LEASE_TTL_SECS, Lease, generate_holder_id};
pub use local::{LocalStateStore, STATE_DIR};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{AppliedRecord, MAX_RUN_HISTORY, ProjectState, RecordStatus};
