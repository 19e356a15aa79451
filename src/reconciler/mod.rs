//! Reconciler for converging a project to its desired state.
//!
//! The reconciler holds the project lease for the duration of a run, executes
//! plan operations strictly in order, checkpoints every operation in the state
//! store before touching the provider, and records each outcome in a
//! [`ReconciliationRun`]. Operation failures never escape [`Reconciler::apply`];
//! only lease contention and state store failures do.

mod clock;
mod drift;
mod retry;
mod run;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::driver::{DriverRegistry, DriverResult, ResourceDriver};
use crate::error::{DriverError, FailureClass, PilotError, ReconcileError, Result, StateError};
use crate::planner::{Action, Operation, Plan, PlanBuilder};
use crate::resource::{RemovalMarker, ResourceDescriptor, ResourceKey};
use crate::state::{AppliedRecord, DEFAULT_LEASE_TTL_SECS, Lease, RecordStatus, StateStore, generate_holder_id};

pub use clock::{Clock, ManualClock, SystemClock};
pub use drift::{DriftEntry, DriftReport, DriftState};
pub use retry::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, RetryPolicy};
pub use run::{Outcome, ReconciliationRun, RunEntry, RunRecorder, RunStatus, SkipReason};

/// Outcome of one operation plus the reason, if any, the run must stop.
struct Step {
    outcome: Outcome,
    abort: Option<SkipReason>,
}

impl Step {
    const fn done(outcome: Outcome) -> Self {
        Self { outcome, abort: None }
    }
}

/// Executes plans against the resource drivers.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    drivers: DriverRegistry,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    lease_ttl: Duration,
    holder: String,
    cancel: CancellationToken,
    run_timeout: Option<Duration>,
}

impl Reconciler {
    /// Creates a reconciler with default retry policy, system clock and lease TTL.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, drivers: DriverRegistry) -> Self {
        Self {
            store,
            drivers,
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            holder: generate_holder_id(),
            cancel: CancellationToken::new(),
            run_timeout: None,
        }
    }

    /// Sets the retry policy for transient driver failures.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the clock used for backoff waits and timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the lease time-to-live.
    #[must_use]
    pub const fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Sets the lease holder identifier.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Abandons runs when `token` is cancelled.
    ///
    /// Cancellation is observed between operations and during backoff waits,
    /// never in the middle of a driver call.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Bounds how long a run may keep starting operations.
    #[must_use]
    pub const fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Returns the lease holder identifier.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Builds a plan without taking the lease or executing anything.
    ///
    /// # Errors
    ///
    /// Returns planning errors and state store failures.
    pub async fn plan(
        &self,
        project_id: &str,
        desired: &[ResourceDescriptor],
        removals: &[RemovalMarker],
    ) -> Result<Plan> {
        PlanBuilder::new(self.store.as_ref())
            .build_plan(project_id, desired, removals)
            .await
    }

    /// Executes a prebuilt plan under the project lease.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrentReconciliationInProgress` if another run holds the
    /// lease and `StateStoreUnavailable` if progress cannot be recorded.
    pub async fn apply(&self, plan: &Plan) -> Result<ReconciliationRun> {
        let mut lease = self.acquire(plan.project_id()).await?;
        let result = self.execute(plan, &mut lease).await;
        self.release(&lease).await;
        result
    }

    /// Takes the lease, builds the plan from current state, and executes it.
    ///
    /// Planning happens under the lease so the plan cannot be stale.
    ///
    /// # Errors
    ///
    /// Returns planning errors, `ConcurrentReconciliationInProgress`, and
    /// `StateStoreUnavailable`.
    pub async fn reconcile(
        &self,
        project_id: &str,
        desired: &[ResourceDescriptor],
        removals: &[RemovalMarker],
    ) -> Result<ReconciliationRun> {
        let mut lease = self.acquire(project_id).await?;

        let plan = match self.plan(project_id, desired, removals).await {
            Ok(plan) => plan,
            Err(err) => {
                self.release(&lease).await;
                return Err(match err {
                    PilotError::State(e) => store_failure(project_id, &PilotError::State(e)),
                    other => other,
                });
            }
        };

        let result = self.execute(&plan, &mut lease).await;
        self.release(&lease).await;
        result
    }

    /// Compares applied records with what the drivers currently report.
    ///
    /// # Errors
    ///
    /// Returns state store failures. Driver failures are reported per entry.
    pub async fn inspect_drift(&self, project_id: &str) -> Result<DriftReport> {
        let records = self.store.list(project_id).await?;
        let mut entries = Vec::with_capacity(records.len());

        for record in records.into_iter().filter(|r| r.status == RecordStatus::Applied) {
            let driver = self.drivers.get(record.kind);
            let state = match driver.describe_current(project_id, &record.identity).await {
                Ok(handle) => DriftState::Present { provider_id: handle.id },
                Err(DriverError::NotFound { .. }) => DriftState::Missing,
                Err(err) => DriftState::Unreachable {
                    message: err.to_string(),
                },
            };
            debug!("Drift check {}: {state}", record.key());
            entries.push(DriftEntry {
                key: record.key(),
                state,
            });
        }

        Ok(DriftReport {
            project_id: project_id.to_string(),
            entries,
        })
    }

    async fn acquire(&self, project_id: &str) -> Result<Lease> {
        match self
            .store
            .acquire_lease(project_id, &self.holder, self.lease_ttl, self.clock.now())
            .await
        {
            Ok(lease) => {
                debug!("Holding lease {} for {project_id}", lease.lease_id);
                Ok(lease)
            }
            Err(PilotError::State(StateError::LeaseBusy { holder, .. })) => {
                warn!("Reconciliation for {project_id} already in progress (holder: {holder})");
                Err(ReconcileError::ConcurrentReconciliationInProgress {
                    project: project_id.to_string(),
                    holder,
                }
                .into())
            }
            Err(err) => Err(store_failure(project_id, &err)),
        }
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.store.release_lease(lease).await {
            warn!("Failed to release lease for {}: {e}", lease.project);
        }
    }

    /// Renews the lease. Returns false if it was taken over.
    async fn renew(&self, lease: &mut Lease) -> Result<bool> {
        match self.store.renew_lease(lease, self.lease_ttl, self.clock.now()).await {
            Ok(renewed) => {
                *lease = renewed;
                Ok(true)
            }
            Err(PilotError::State(StateError::LeaseNotHeld { .. })) => {
                error!("Lost lease {} for {}", lease.lease_id, lease.project);
                Ok(false)
            }
            Err(err) => Err(store_failure(&lease.project, &err)),
        }
    }

    async fn execute(&self, plan: &Plan, lease: &mut Lease) -> Result<ReconciliationRun> {
        let project_id = plan.project_id();
        let token = self.cancel.child_token();
        let deadline = self.run_timeout.map(|t| self.clock.now() + to_chrono(t));

        info!("Executing plan {} for {project_id}: {}", plan.plan_id(), plan.summary());

        let mut recorder = RunRecorder::start(plan, self.clock.now());
        for key in plan.unchanged() {
            recorder.unchanged(key);
        }

        let mut blocked: BTreeSet<ResourceKey> = BTreeSet::new();
        let mut abort: Option<SkipReason> = None;

        for op in plan.operations() {
            if abort.is_none() {
                abort = self.interruption(&token, deadline);
            }
            if let Some(reason) = &abort {
                debug!("Skipping {}: {reason}", op.key());
                recorder.skip(op, reason.clone());
                blocked.insert(op.key().clone());
                continue;
            }

            if let Some(upstream) = op.depends_on.iter().find(|k| blocked.contains(*k)) {
                warn!("Skipping {} because {upstream} did not converge", op.key());
                recorder.skip(op, SkipReason::DependencyFailed {
                    upstream: upstream.clone(),
                });
                blocked.insert(op.key().clone());
                continue;
            }

            if !self.renew(lease).await? {
                token.cancel();
                abort = Some(SkipReason::LeaseLost);
                recorder.skip(op, SkipReason::LeaseLost);
                blocked.insert(op.key().clone());
                continue;
            }

            let step = self.execute_operation(project_id, op, lease, &token).await?;
            if !step.outcome.is_converged() {
                blocked.insert(op.key().clone());
            }
            if step.abort.is_some() {
                abort = step.abort;
            }
            recorder.record(op, step.outcome);
        }

        let run = recorder.seal(self.clock.now());
        self.store
            .append_run(&run)
            .await
            .map_err(|e| store_failure(project_id, &e))?;

        info!(
            "Run {} for {project_id} finished: {} ({} applied, {} unchanged, {} failed, {} skipped)",
            run.plan_id,
            run.status,
            run.count("applied"),
            run.count("unchanged"),
            run.count("failed"),
            run.count("skipped")
        );
        Ok(run)
    }

    fn interruption(&self, token: &CancellationToken, deadline: Option<DateTime<Utc>>) -> Option<SkipReason> {
        if token.is_cancelled() {
            warn!("Run cancelled, skipping remaining operations");
            return Some(SkipReason::Cancelled);
        }
        if deadline.is_some_and(|d| self.clock.now() >= d) {
            warn!("Run deadline exceeded, skipping remaining operations");
            return Some(SkipReason::DeadlineExceeded);
        }
        None
    }

    /// Runs one operation to completion: checkpoint, driver call with retries,
    /// then the final record.
    async fn execute_operation(
        &self,
        project_id: &str,
        op: &Operation,
        lease: &mut Lease,
        token: &CancellationToken,
    ) -> Result<Step> {
        let key = op.key();
        let driver = self.drivers.get(op.kind());

        let previous = self
            .store
            .get(project_id, key)
            .await
            .map_err(|e| store_failure(project_id, &e))?;
        let record = AppliedRecord::pending(key, previous.as_ref(), self.clock.now());
        self.persist(project_id, &record).await?;

        let mut action = op.action;
        let mut escalated = false;
        let mut attempts = 0;

        loop {
            attempts += 1;
            info!(
                project = %project_id,
                kind = %op.kind(),
                identity = %op.identity(),
                attempt = attempts,
                "{action} {key}"
            );

            let err = match invoke(driver, project_id, op, action).await {
                Ok(provider_id) => {
                    return self
                        .complete(project_id, op, record, provider_id, attempts)
                        .await
                        .map(Step::done);
                }
                Err(DriverError::NotFound { .. }) if action == Action::Delete => {
                    debug!("{key} already absent");
                    return self
                        .complete(project_id, op, record, None, attempts)
                        .await
                        .map(Step::done);
                }
                Err(DriverError::NotFound { .. }) if action == Action::Update && !escalated => {
                    warn!("{key} not found on update, creating it instead");
                    escalated = true;
                    action = Action::Create;
                    continue;
                }
                Err(err) => err,
            };

            if !(err.is_transient() && self.retry.allows_retry(attempts)) {
                error!("{action} {key} failed after {attempts} attempt(s): {err}");
                self.persist(project_id, &record.failed(self.clock.now()))
                    .await?;
                return Ok(Step::done(Outcome::Failed {
                    class: err.class(),
                    message: err.to_string(),
                    attempts,
                }));
            }

            let delay = self.retry.delay_for(attempts, err.retry_after());
            warn!(
                "{action} {key} failed with transient error, retrying in {}ms: {err}",
                delay.as_millis()
            );

            tokio::select! {
                biased;
                () = token.cancelled() => {
                    warn!("Backoff for {key} abandoned, record left pending");
                    return Ok(Step {
                        outcome: Outcome::Failed {
                            class: FailureClass::Transient,
                            message: format!("retry abandoned: {err}"),
                            attempts,
                        },
                        abort: Some(SkipReason::Cancelled),
                    });
                }
                () = self.clock.sleep(delay) => {}
            }

            if !self.renew(lease).await? {
                token.cancel();
                return Ok(Step {
                    outcome: Outcome::Failed {
                        class: FailureClass::Transient,
                        message: format!("lease lost before retry: {err}"),
                        attempts,
                    },
                    abort: Some(SkipReason::LeaseLost),
                });
            }
        }
    }

    async fn complete(
        &self,
        project_id: &str,
        op: &Operation,
        record: AppliedRecord,
        provider_id: Option<String>,
        attempts: u32,
    ) -> Result<Outcome> {
        if op.action == Action::Delete {
            self.store
                .remove(project_id, op.key())
                .await
                .map_err(|e| store_failure(project_id, &e))?;
        } else {
            let applied = record.applied(op.descriptor.checksum(), provider_id.clone(), self.clock.now());
            self.persist(project_id, &applied).await?;
        }

        info!("{} {} succeeded", op.action, op.key());
        Ok(Outcome::Applied { provider_id, attempts })
    }

    async fn persist(&self, project_id: &str, record: &AppliedRecord) -> Result<()> {
        self.store
            .put(project_id, record)
            .await
            .map_err(|e| store_failure(project_id, &e))
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("store", &self.store.backend_type())
            .field("retry", &self.retry)
            .field("lease_ttl", &self.lease_ttl)
            .field("holder", &self.holder)
            .field("run_timeout", &self.run_timeout)
            .finish_non_exhaustive()
    }
}

async fn invoke(
    driver: &dyn ResourceDriver,
    project_id: &str,
    op: &Operation,
    action: Action,
) -> DriverResult<Option<String>> {
    let handle = match action {
        Action::Create => driver.create(project_id, &op.descriptor).await?,
        Action::Update => driver.update(project_id, &op.descriptor).await?,
        Action::Delete => {
            driver.delete(project_id, op.identity()).await?;
            return Ok(None);
        }
        Action::NoOp => return Ok(None),
    };
    Ok(Some(handle.id).filter(|id| !id.is_empty()))
}

fn store_failure(project_id: &str, err: &PilotError) -> PilotError {
    error!("State store failure for {project_id}: {err}");
    ReconcileError::StateStoreUnavailable {
        project: project_id.to_string(),
        message: err.to_string(),
    }
    .into()
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
