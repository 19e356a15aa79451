//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) so several operators or workers can share one state.
//!
//! Every lease transition is a conditional write: the first acquisition uses
//! `If-None-Match: *`, and taking over, renewing or releasing uses `If-Match`
//! on the ETag that was read. A released lease is stored as `null`.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use serde::Serialize;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{PilotError, Result, StateError};
use crate::reconciler::ReconciliationRun;
use crate::resource::ResourceKey;

use super::lease::Lease;
use super::store::{StateStore, validate_project_segment};
use super::types::{AppliedRecord, MAX_RUN_HISTORY, ProjectState};

/// Record document key suffix.
const STATE_KEY: &str = "state.json";

/// Lease object key suffix.
const LEASE_KEY: &str = "lease.json";

/// Run history key suffix.
const RUNS_KEY: &str = "runs.json";

/// Stored content of the lease object. `None` once released.
type LeaseSlot = Option<Lease>;

/// How a conditional put ended.
enum ConditionalPut {
    Written,
    PreconditionFailed,
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a project file.
    fn key(&self, project: &str, file: &str) -> Result<String> {
        validate_project_segment(project)?;
        Ok(format!("{}{project}/{file}", self.prefix))
    }

    /// Gets an object and its ETag.
    async fn get_object(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self.client.get_object().bucket(&self.bucket).key(key).send().await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(ToString::to_string);
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::unavailable(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::unavailable(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, Option<String>)>> {
        match self.get_object(key).await? {
            Some((content, etag)) => {
                let value = serde_json::from_str(&content)
                    .map_err(|e| StateError::corrupted(format!("Failed to parse s3://{}/{key}: {e}", self.bucket)))?;
                Ok(Some((value, etag)))
            }
            None => Ok(None),
        }
    }

    /// Puts an object unconditionally.
    async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let content = to_json(value)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into_bytes().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::unavailable(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Puts an object only if it does not exist (`etag == None`) or still has `etag`.
    async fn put_json_conditional<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        etag: Option<&str>,
    ) -> Result<ConditionalPut> {
        let content = to_json(value)?;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into_bytes().into())
            .content_type("application/json");

        request = match etag {
            Some(tag) => request.if_match(tag),
            None => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(_) => Ok(ConditionalPut::Written),
            Err(err) if is_precondition_failure(&err) => Ok(ConditionalPut::PreconditionFailed),
            Err(err) => Err(StateError::unavailable(format!("S3 conditional put error: {err}")).into()),
        }
    }

    async fn load_project(&self, project: &str) -> Result<ProjectState> {
        let key = self.key(project, STATE_KEY)?;
        Ok(self
            .get_json(&key)
            .await?
            .map_or_else(|| ProjectState::new(project), |(state, _)| state))
    }

    async fn save_project(&self, state: &ProjectState) -> Result<()> {
        let key = self.key(&state.project, STATE_KEY)?;
        self.put_json(&key, state).await
    }

    /// Reads the lease object with the ETag needed to replace it.
    async fn lease_slot(&self, key: &str) -> Result<Option<(LeaseSlot, String)>> {
        match self.get_json::<LeaseSlot>(key).await? {
            Some((slot, Some(etag))) => Ok(Some((slot, etag))),
            Some((_, None)) => Err(StateError::unavailable(format!(
                "s3://{}/{key} has no ETag; leases need conditional writes",
                self.bucket
            ))
            .into()),
            None => Ok(None),
        }
    }

    fn busy(project: &str, existing: Option<&Lease>) -> StateError {
        StateError::LeaseBusy {
            project: project.to_string(),
            holder: existing.map_or_else(|| String::from("unknown"), |l| l.holder.clone()),
            expires_at: existing.map_or_else(|| String::from("unknown"), |l| l.expires_at.to_rfc3339()),
        }
    }
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() { String::new() } else { format!("{p}/") }
        })
        .unwrap_or_default()
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")).into())
}

/// 412 is a failed precondition; 409 is a concurrent conditional write.
fn is_precondition_failure<E>(err: &SdkError<E, HttpResponse>) -> bool {
    err.raw_response()
        .is_some_and(|r| matches!(r.status().as_u16(), 409 | 412))
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn get(&self, project: &str, key: &ResourceKey) -> Result<Option<AppliedRecord>> {
        Ok(self.load_project(project).await?.get(key).cloned())
    }

    async fn put(&self, project: &str, record: &AppliedRecord) -> Result<()> {
        let mut state = self.load_project(project).await?;
        state.set(record.clone());
        self.save_project(&state).await?;
        debug!(
            "Persisted {}/{} for {project} to s3://{}: {}",
            record.kind, record.identity, self.bucket, record.status
        );
        Ok(())
    }

    async fn remove(&self, project: &str, key: &ResourceKey) -> Result<()> {
        let mut state = self.load_project(project).await?;
        if state.remove(key).is_some() {
            self.save_project(&state).await?;
        }
        Ok(())
    }

    async fn list(&self, project: &str) -> Result<Vec<AppliedRecord>> {
        Ok(self.load_project(project).await?.all())
    }

    async fn acquire_lease(&self, project: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        let key = self.key(project, LEASE_KEY)?;
        let lease = Lease::new(project, holder, ttl, now);
        let slot: LeaseSlot = Some(lease.clone());

        let etag = match self.lease_slot(&key).await {
            Ok(None) => None,
            Ok(Some((Some(current), _))) if !current.is_expired_at(now) => {
                return Err(Self::busy(project, Some(&current)).into());
            }
            Ok(Some((Some(current), etag))) => {
                debug!("Expired lease for {project} held by {}, taking over", current.holder);
                Some(etag)
            }
            Ok(Some((None, etag))) => Some(etag),
            Err(PilotError::State(StateError::Corrupted { message })) => {
                debug!("Unreadable lease for {project}, treating as busy: {message}");
                return Err(Self::busy(project, None).into());
            }
            Err(e) => return Err(e),
        };

        match self.put_json_conditional(&key, &slot, etag.as_deref()).await? {
            ConditionalPut::Written => {
                info!("Acquired lease {} for project {project}", lease.lease_id);
                Ok(lease)
            }
            ConditionalPut::PreconditionFailed => {
                let current = self
                    .lease_slot(&key)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|(slot, _)| slot);
                Err(Self::busy(project, current.as_ref()).into())
            }
        }
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        let key = self.key(&lease.project, LEASE_KEY)?;
        let not_held = || StateError::LeaseNotHeld {
            project: lease.project.clone(),
            lease_id: lease.lease_id.clone(),
        };

        let Some((Some(current), etag)) = self.lease_slot(&key).await? else {
            return Err(not_held().into());
        };
        if !current.same_acquisition(lease) {
            return Err(not_held().into());
        }

        let renewed = current.renewed(ttl, now);
        match self.put_json_conditional(&key, &Some(renewed.clone()), Some(&etag)).await? {
            ConditionalPut::Written => {
                debug!("Renewed lease {} for {}", renewed.lease_id, renewed.project);
                Ok(renewed)
            }
            ConditionalPut::PreconditionFailed => Err(not_held().into()),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let key = self.key(&lease.project, LEASE_KEY)?;

        match self.lease_slot(&key).await? {
            Some((Some(current), etag)) if current.same_acquisition(lease) => {
                match self.put_json_conditional(&key, &LeaseSlot::None, Some(&etag)).await? {
                    ConditionalPut::Written => {
                        info!("Released lease {} for project {}", lease.lease_id, lease.project);
                    }
                    ConditionalPut::PreconditionFailed => {
                        debug!("Lease {} for {} changed while releasing", lease.lease_id, lease.project);
                    }
                }
            }
            Some((Some(current), _)) => {
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
        let key = self.key(project, LEASE_KEY)?;
        Ok(self.get_json::<LeaseSlot>(&key).await?.and_then(|(slot, _)| slot))
    }

    async fn force_release_lease(&self, project: &str) -> Result<bool> {
        let key = self.key(project, LEASE_KEY)?;
        let Some((Some(_), etag)) = self.lease_slot(&key).await? else {
            return Ok(false);
        };

        let removed = matches!(
            self.put_json_conditional(&key, &LeaseSlot::None, Some(&etag)).await?,
            ConditionalPut::Written
        );
        if removed {
            info!("Force-released lease for project {project}");
        }
        Ok(removed)
    }

    async fn append_run(&self, run: &ReconciliationRun) -> Result<()> {
        let key = self.key(&run.project_id, RUNS_KEY)?;
        let mut runs: Vec<ReconciliationRun> = self.get_json(&key).await?.map(|(r, _)| r).unwrap_or_default();

        runs.push(run.clone());
        if runs.len() > MAX_RUN_HISTORY {
            let excess = runs.len() - MAX_RUN_HISTORY;
            runs.drain(..excess);
        }

        self.put_json(&key, &runs).await
    }

    async fn recent_runs(&self, project: &str, limit: usize) -> Result<Vec<ReconciliationRun>> {
        let key = self.key(project, RUNS_KEY)?;
        let runs: Vec<ReconciliationRun> = self.get_json(&key).await?.map(|(r, _)| r).unwrap_or_default();
        Ok(runs.into_iter().rev().take(limit).collect())
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
