//! Local file-based state storage backend.
//!
//! Each project gets its own directory holding the record document, the lease
//! generations and the run history. Documents are written to a temporary file
//! and renamed into place.
//!
//! The lease is a sequence of numbered files, `lease-<n>.json`, the highest
//! being current. Every transition (acquire, renew, release) writes generation
//! `n + 1` through a hard link from a fully written temporary file. A hard link
//! fails if the target exists, so for a given `n` only one caller can install
//! the next generation; that is the compare-and-swap on a single machine. A
//! released lease is stored as `null`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PilotError, Result, StateError};
use crate::reconciler::ReconciliationRun;
use crate::resource::ResourceKey;

use super::lease::Lease;
use super::store::{StateStore, validate_project_segment};
use super::types::{AppliedRecord, MAX_RUN_HISTORY, ProjectState};

/// Default state directory name.
pub const STATE_DIR: &str = ".provision-pilot";

/// Record document file name.
const STATE_FILE: &str = "state.json";

/// Lease generation file prefix.
const LEASE_PREFIX: &str = "lease-";

/// Lease generation file suffix.
const LEASE_SUFFIX: &str = ".json";

/// Stored content of one lease generation. `None` once released.
type LeaseSlot = Option<Lease>;

/// Run history file name.
const RUNS_FILE: &str = "runs.json";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory holding one sub-directory per project.
    base_dir: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| PilotError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn project_dir(&self, project: &str) -> Result<PathBuf> {
        validate_project_segment(project)?;
        Ok(self.base_dir.join(project))
    }

    async fn ensure_dir(dir: &Path) -> Result<()> {
        if !dir.exists() {
            debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(dir)
                .await
                .map_err(|e| StateError::unavailable(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::unavailable(format!("Failed to read {}: {e}", path.display())).into());
            }
        };

        let value = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse {}: {e}", path.display())))?;
        Ok(Some(value))
    }

    /// Writes a document through a temporary file and an atomic rename.
    async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            Self::ensure_dir(parent).await?;
        }

        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::unavailable(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::unavailable(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::unavailable(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::unavailable(format!("Failed to rename state file: {e}")))?;

        Ok(())
    }

    async fn remove_file(path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::unavailable(format!("Failed to delete {}: {e}", path.display())).into()),
        }
    }

    async fn load_project(&self, project: &str) -> Result<ProjectState> {
        let path = self.project_dir(project)?.join(STATE_FILE);
        Ok(Self::read_json(&path)
            .await?
            .unwrap_or_else(|| ProjectState::new(project)))
    }

    async fn save_project(&self, state: &ProjectState) -> Result<()> {
        let path = self.project_dir(&state.project)?.join(STATE_FILE);
        Self::write_json(&path, state).await
    }

    fn lease_path(dir: &Path, generation: u64) -> PathBuf {
        dir.join(format!("{LEASE_PREFIX}{generation}{LEASE_SUFFIX}"))
    }

    /// Lease generations present in `dir`, ascending.
    async fn lease_generations(dir: &Path) -> Result<Vec<u64>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::unavailable(format!("Failed to list {}: {e}", dir.display())).into());
            }
        };

        let mut generations = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::unavailable(format!("Failed to list {}: {e}", dir.display())))?
        {
            let name = entry.file_name();
            let generation = name
                .to_str()
                .and_then(|n| n.strip_prefix(LEASE_PREFIX))
                .and_then(|n| n.strip_suffix(LEASE_SUFFIX))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(generation) = generation {
                generations.push(generation);
            }
        }

        generations.sort_unstable();
        Ok(generations)
    }

    /// Latest lease generation and its content.
    ///
    /// Returns `None` if no lease was ever taken in `dir`.
    async fn current_slot(dir: &Path) -> Result<Option<(u64, LeaseSlot)>> {
        // The listed generation can be pruned before it is read; list again.
        for _ in 0..3 {
            let Some(&latest) = Self::lease_generations(dir).await?.last() else {
                return Ok(None);
            };
            if let Some(slot) = Self::read_json::<LeaseSlot>(&Self::lease_path(dir, latest)).await? {
                return Ok(Some((latest, slot)));
            }
        }
        Err(StateError::unavailable(format!("Lease generations in {} keep changing", dir.display())).into())
    }

    /// Installs `slot` as lease generation `generation`.
    ///
    /// Returns false if that generation already exists, or if a newer one
    /// appeared meanwhile.
    async fn install_slot(dir: &Path, generation: u64, slot: &LeaseSlot) -> Result<bool> {
        let content = serde_json::to_string_pretty(slot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lease: {e}")))?;

        let temp_path = dir.join(format!(".lease-{}.tmp", Uuid::new_v4().simple()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::unavailable(format!("Failed to create lease file: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::unavailable(format!("Failed to write lease file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::unavailable(format!("Failed to sync lease file: {e}")))?;
        drop(file);

        let target = Self::lease_path(dir, generation);
        let linked = fs::hard_link(&temp_path, &target).await;
        if let Err(e) = fs::remove_file(&temp_path).await {
            debug!("Failed to remove {}: {e}", temp_path.display());
        }

        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StateError::unavailable(format!("Failed to install lease file: {e}")).into());
            }
        }

        // A caller working from a pruned generation can link it again; it
        // must not count as current.
        let generations = Self::lease_generations(dir).await?;
        if generations.last().is_some_and(|&latest| latest > generation) {
            Self::remove_file(&target).await?;
            return Ok(false);
        }

        for old in generations.into_iter().filter(|&g| g + 1 < generation) {
            Self::remove_file(&Self::lease_path(dir, old)).await?;
        }
        Ok(true)
    }

    fn busy(project: &str, current: Option<&Lease>) -> PilotError {
        StateError::LeaseBusy {
            project: project.to_string(),
            holder: current.map_or_else(|| String::from("unknown"), |l| l.holder.clone()),
            expires_at: current.map_or_else(|| String::from("unknown"), |l| l.expires_at.to_rfc3339()),
        }
        .into()
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get(&self, project: &str, key: &ResourceKey) -> Result<Option<AppliedRecord>> {
        Ok(self.load_project(project).await?.get(key).cloned())
    }

    async fn put(&self, project: &str, record: &AppliedRecord) -> Result<()> {
        let mut state = self.load_project(project).await?;
        state.set(record.clone());
        self.save_project(&state).await?;
        debug!(
            "Persisted {}/{} for {project}: {} (generation {})",
            record.kind, record.identity, record.status, record.generation
        );
        Ok(())
    }

    async fn remove(&self, project: &str, key: &ResourceKey) -> Result<()> {
        let mut state = self.load_project(project).await?;
        if state.remove(key).is_some() {
            self.save_project(&state).await?;
            debug!("Removed record {key} for {project}");
        }
        Ok(())
    }

    async fn list(&self, project: &str) -> Result<Vec<AppliedRecord>> {
        Ok(self.load_project(project).await?.all())
    }

    async fn acquire_lease(&self, project: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        let dir = self.project_dir(project)?;
        Self::ensure_dir(&dir).await?;

        let next = match Self::current_slot(&dir).await {
            Ok(None) => 1,
            Ok(Some((generation, None))) => generation + 1,
            Ok(Some((_, Some(current)))) if !current.is_expired_at(now) => {
                return Err(Self::busy(project, Some(&current)));
            }
            Ok(Some((generation, Some(current)))) => {
                debug!("Expired lease for {project} held by {}, taking over", current.holder);
                generation + 1
            }
            Err(PilotError::State(StateError::Corrupted { message })) => {
                debug!("Unreadable lease for {project}, treating as busy: {message}");
                return Err(Self::busy(project, None));
            }
            Err(e) => return Err(e),
        };

        let lease = Lease::new(project, holder, ttl, now);
        if Self::install_slot(&dir, next, &Some(lease.clone())).await? {
            info!("Acquired lease {} for project {project}", lease.lease_id);
            return Ok(lease);
        }

        let current = Self::current_slot(&dir).await.ok().flatten().and_then(|(_, slot)| slot);
        Err(Self::busy(project, current.as_ref()))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        let dir = self.project_dir(&lease.project)?;
        let not_held = || -> PilotError {
            StateError::LeaseNotHeld {
                project: lease.project.clone(),
                lease_id: lease.lease_id.clone(),
            }
            .into()
        };

        match Self::current_slot(&dir).await? {
            Some((generation, Some(current))) if current.same_acquisition(lease) => {
                let renewed = current.renewed(ttl, now);
                if Self::install_slot(&dir, generation + 1, &Some(renewed.clone())).await? {
                    debug!("Renewed lease {} for {}", renewed.lease_id, renewed.project);
                    Ok(renewed)
                } else {
                    Err(not_held())
                }
            }
            _ => Err(not_held()),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let dir = self.project_dir(&lease.project)?;

        match Self::current_slot(&dir).await? {
            Some((generation, Some(current))) if current.same_acquisition(lease) => {
                if Self::install_slot(&dir, generation + 1, &None).await? {
                    info!("Released lease {} for project {}", lease.lease_id, lease.project);
                } else {
                    debug!("Lease {} for {} changed while releasing", lease.lease_id, lease.project);
                }
            }
            Some((_, Some(current))) => {
                debug!(
                    "Lease ID mismatch: expected {}, found {}",
                    lease.lease_id, current.lease_id
                );
            }
            _ => {}
        }
        Ok(())
    }

    async fn current_lease(&self, project: &str) -> Result<Option<Lease>> {
        let dir = self.project_dir(project)?;
        Ok(Self::current_slot(&dir).await?.and_then(|(_, slot)| slot))
    }

    async fn force_release_lease(&self, project: &str) -> Result<bool> {
        let dir = self.project_dir(project)?;
        let Some((generation, Some(_))) = Self::current_slot(&dir).await? else {
            return Ok(false);
        };

        let removed = Self::install_slot(&dir, generation + 1, &None).await?;
        if removed {
            info!("Force-released lease for project {project}");
        }
        Ok(removed)
    }

    async fn append_run(&self, run: &ReconciliationRun) -> Result<()> {
        let path = self.project_dir(&run.project_id)?.join(RUNS_FILE);
        let mut runs: Vec<ReconciliationRun> = Self::read_json(&path).await?.unwrap_or_default();

        runs.push(run.clone());
        if runs.len() > MAX_RUN_HISTORY {
            let excess = runs.len() - MAX_RUN_HISTORY;
            runs.drain(..excess);
        }

        Self::write_json(&path, &runs).await
    }

    async fn recent_runs(&self, project: &str, limit: usize) -> Result<Vec<ReconciliationRun>> {
        let path = self.project_dir(project)?.join(RUNS_FILE);
        let runs: Vec<ReconciliationRun> = Self::read_json(&path).await?.unwrap_or_default();
        Ok(runs.into_iter().rev().take(limit).collect())
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn record(kind: ResourceKind, identity: &str) -> AppliedRecord {
        AppliedRecord::pending(&ResourceKey::new(kind, identity), None, Utc::now()).applied(
            "abc",
            Some(format!("{identity}-id")),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _temp) = create_test_store();
        let rec = record(ResourceKind::Secret, "db-password");

        store.put("p1", &rec).await.expect("Failed to put record");

        let loaded = store
            .get("p1", &rec.key())
            .await
            .expect("Failed to get record")
            .expect("Record should exist");
        assert_eq!(loaded, rec);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _temp) = create_test_store();
        let key = ResourceKey::new(ResourceKind::Project, "p1");

        assert!(store.get("p1", &key).await.expect("get should not fail").is_none());
        assert!(store.list("p1").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let (store, _temp) = create_test_store();
        store.put("p1", &record(ResourceKind::Topic, "b")).await.expect("put");
        store.put("p1", &record(ResourceKind::Project, "p1")).await.expect("put");

        let listed = store.list("p1").await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].kind, ResourceKind::Project);

        store
            .remove("p1", &ResourceKey::new(ResourceKind::Topic, "b"))
            .await
            .expect("remove");
        assert_eq!(store.list("p1").await.expect("list").len(), 1);
    }

    const MINUTE: Duration = Duration::from_secs(60);

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_000_000 + secs, 0).expect("timestamp")
    }

    #[tokio::test]
    async fn test_lease_acquire_release() {
        let (store, _temp) = create_test_store();

        let lease = store
            .acquire_lease("p1", "holder-1", MINUTE, at(0))
            .await
            .expect("Failed to acquire lease");

        let busy = store.acquire_lease("p1", "holder-2", MINUTE, at(10)).await;
        assert!(matches!(busy, Err(PilotError::State(StateError::LeaseBusy { .. }))));

        let renewed = store
            .renew_lease(&lease, Duration::from_secs(120), at(30))
            .await
            .expect("Failed to renew lease");
        assert_eq!(renewed.expires_at, at(150));
        assert_eq!(store.current_lease("p1").await.expect("current"), Some(renewed));

        store.release_lease(&lease).await.expect("Failed to release lease");
        assert!(store.current_lease("p1").await.expect("current").is_none());

        let again = store
            .acquire_lease("p1", "holder-2", MINUTE, at(40))
            .await
            .expect("released lease is free");
        assert_eq!(again.holder, "holder-2");
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let (store, _temp) = create_test_store();

        let stale = store.acquire_lease("p1", "crashed", MINUTE, at(0)).await.expect("acquire");
        let fresh = store
            .acquire_lease("p1", "recovering", MINUTE, at(61))
            .await
            .expect("expired lease should be reclaimable");
        assert_eq!(fresh.holder, "recovering");

        let renew = store.renew_lease(&stale, MINUTE, at(62)).await;
        assert!(matches!(renew, Err(PilotError::State(StateError::LeaseNotHeld { .. }))));

        // the stale holder's release leaves the new lease in place
        store.release_lease(&stale).await.expect("release");
        assert_eq!(store.current_lease("p1").await.expect("current"), Some(fresh));
    }

    #[tokio::test]
    async fn test_old_generations_are_pruned() {
        let (store, temp) = create_test_store();
        let mut lease = store.acquire_lease("p1", "h", MINUTE, at(0)).await.expect("acquire");
        for i in 1..=5 {
            lease = store.renew_lease(&lease, MINUTE, at(i)).await.expect("renew");
        }

        let generations = LocalStateStore::lease_generations(&temp.path().join("p1"))
            .await
            .expect("list");
        assert_eq!(generations, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_relinking_a_pruned_generation_does_not_win() {
        let (store, temp) = create_test_store();
        let dir = temp.path().join("p1");
        let mut lease = store.acquire_lease("p1", "h", MINUTE, at(0)).await.expect("acquire");
        for i in 1..=3 {
            lease = store.renew_lease(&lease, MINUTE, at(i)).await.expect("renew");
        }

        // generation 1 is gone; a caller that last saw generation 0 would link it
        let late = Lease::new("p1", "late", MINUTE, at(100));
        let installed = LocalStateStore::install_slot(&dir, 1, &Some(late)).await.expect("install");

        assert!(!installed);
        assert_eq!(store.current_lease("p1").await.expect("current"), Some(lease));
    }

    #[tokio::test]
    async fn test_unreadable_lease_is_busy() {
        let (store, temp) = create_test_store();
        let dir = temp.path().join("p1");
        fs::create_dir_all(&dir).await.expect("mkdir");
        fs::write(dir.join("lease-1.json"), "{\"lease_id\":").await.expect("write");

        let result = store.acquire_lease("p1", "h", MINUTE, at(0)).await;
        assert!(matches!(result, Err(PilotError::State(StateError::LeaseBusy { .. }))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_reclaim_of_expired_lease_single_winner() {
        for _ in 0..50 {
            let temp = TempDir::new().expect("temp dir");
            let store = Arc::new(LocalStateStore::with_base_dir(temp.path()));
            store.acquire_lease("p1", "crashed", MINUTE, at(0)).await.expect("seed");

            let mut handles = Vec::new();
            for i in 0..8 {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    store.acquire_lease("p1", &format!("h{i}"), MINUTE, at(120)).await
                }));
            }

            let mut winners = Vec::new();
            for handle in handles {
                match handle.await.expect("join") {
                    Ok(lease) => winners.push(lease),
                    Err(PilotError::State(StateError::LeaseBusy { .. })) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }

            assert_eq!(winners.len(), 1);
            let current = store.current_lease("p1").await.expect("current");
            assert_eq!(current.as_ref(), winners.first());
        }
    }

    #[tokio::test]
    async fn test_force_release() {
        let (store, _temp) = create_test_store();
        store.acquire_lease("p1", "h", MINUTE, at(0)).await.expect("acquire");

        assert!(store.force_release_lease("p1").await.expect("force"));
        assert!(!store.force_release_lease("p1").await.expect("force"));
        assert!(store.current_lease("p1").await.expect("current").is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (store, _temp) = create_test_store();
        assert!(store.list("../escape").await.is_err());
    }
}
