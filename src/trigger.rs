//! Deployment trigger.
//!
//! Entry point for repository events. Turns a project manifest and a commit
//! into the desired descriptor set, hands it to the [`Reconciler`], and reports
//! a per-resource summary that never hides which resource blocked convergence.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{PilotConfig, ProjectManifest};
use crate::error::{ConfigError, PilotError, ReconcileError, Result};
use crate::notify::ChatNotifier;
use crate::planner::{Action, Plan};
use crate::reconciler::{Outcome, ReconciliationRun, Reconciler, RunStatus};
use crate::resource::{RemovalMarker, ResourceDescriptor, ResourceKind};

/// Role every app service account receives so integrations can invoke it.
pub const INVOKER_ROLE: &str = "roles/run.invoker";

/// Host custom domains are pointed at.
pub const SERVING_FRONT_DOOR: &str = "ghs.googlehosted.com";

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A parsed repository reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryRef {
    /// `refs/heads/<name>` or a bare name.
    Branch(String),
    /// `refs/tags/<name>`.
    Tag(String),
}

impl RepositoryRef {
    /// Parses a git reference.
    #[must_use]
    pub fn parse(reference: &str) -> Self {
        if let Some(tag) = reference.strip_prefix("refs/tags/") {
            Self::Tag(tag.to_string())
        } else {
            let branch = reference.strip_prefix("refs/heads/").unwrap_or(reference);
            Self::Branch(branch.to_string())
        }
    }
}

impl std::fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Branch(b) => write!(f, "branch {b}"),
            Self::Tag(t) => write!(f, "tag {t}"),
        }
    }
}

/// Descriptors and removal markers for one project.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    /// Resources that should exist.
    pub descriptors: Vec<ResourceDescriptor>,
    /// Resources to delete.
    pub removals: Vec<RemovalMarker>,
}

/// Per-resource line of a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource identity.
    pub identity: String,
    /// Planned action.
    pub action: Action,
    /// What happened.
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Result of a trigger invocation, for the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Project reconciled.
    pub project_id: String,
    /// Executed plan, absent when rejected.
    pub plan_id: Option<Uuid>,
    /// Commit that triggered the run.
    pub commit_sha: String,
    /// Final status.
    pub status: RunStatus,
    /// Why the request was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Wall time of the run in milliseconds, absent when rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Per-resource outcomes.
    pub operations: Vec<OperationSummary>,
}

impl RunSummary {
    /// Summary of a request that never started a run.
    #[must_use]
    pub fn rejected(project_id: &str, commit_sha: &str, reason: impl Into<String>) -> Self {
        Self {
            project_id: project_id.to_string(),
            plan_id: None,
            commit_sha: commit_sha.to_string(),
            status: RunStatus::Rejected,
            reason: Some(reason.into()),
            duration_ms: None,
            operations: Vec::new(),
        }
    }

    /// Summarizes a sealed run.
    #[must_use]
    pub fn from_run(run: &ReconciliationRun, commit_sha: &str) -> Self {
        Self {
            project_id: run.project_id.clone(),
            plan_id: Some(run.plan_id),
            commit_sha: commit_sha.to_string(),
            status: run.status,
            reason: None,
            duration_ms: u64::try_from((run.finished_at - run.started_at).num_milliseconds()).ok(),
            operations: run
                .entries
                .iter()
                .map(|e| OperationSummary {
                    kind: e.kind,
                    identity: e.identity.clone(),
                    action: e.action,
                    outcome: e.outcome.clone(),
                })
                .collect(),
        }
    }
}

/// Builds desired state from manifests and runs reconciliations.
pub struct DeploymentTrigger {
    config: PilotConfig,
    reconciler: Reconciler,
    env: EnvLookup,
    notifier: Option<ChatNotifier>,
}

impl DeploymentTrigger {
    /// Creates a trigger reading secret values from the process environment.
    #[must_use]
    pub fn new(config: PilotConfig, reconciler: Reconciler) -> Self {
        Self {
            config,
            reconciler,
            env: Arc::new(|name| std::env::var(name).ok()),
            notifier: None,
        }
    }

    /// Announces settled triggers to each project's chat channel.
    #[must_use]
    pub fn with_notifier(mut self, notifier: ChatNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Replaces the environment lookup used for secret values.
    #[must_use]
    pub fn with_env_lookup(mut self, lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Arc::new(lookup);
        self
    }

    /// Returns the reconciler.
    #[must_use]
    pub const fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &PilotConfig {
        &self.config
    }

    /// Handles a repository event for `project_id`.
    ///
    /// Unknown projects, untracked refs, invalid desired state, planning errors
    /// and lease contention produce a `Rejected` summary. The summary is then
    /// posted to the project's chat channel, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns `StateStoreUnavailable` when progress could not be recorded.
    pub async fn reconcile(&self, project_id: &str, repository_ref: &str, commit_sha: &str) -> Result<RunSummary> {
        let summary = self.run(project_id, repository_ref, commit_sha).await?;
        self.notify(&summary).await;
        Ok(summary)
    }

    async fn run(&self, project_id: &str, repository_ref: &str, commit_sha: &str) -> Result<RunSummary> {
        info!("Trigger for {project_id} at {repository_ref} ({commit_sha})");

        let desired = match self.prepare(project_id, repository_ref, commit_sha) {
            Ok(desired) => desired,
            Err(err) => {
                warn!("Rejected trigger for {project_id}: {err}");
                return Ok(RunSummary::rejected(project_id, commit_sha, err.to_string()));
            }
        };

        match self
            .reconciler
            .reconcile(project_id, &desired.descriptors, &desired.removals)
            .await
        {
            Ok(run) => Ok(RunSummary::from_run(&run, commit_sha)),
            Err(err @ (PilotError::Plan(_)
            | PilotError::Reconcile(ReconcileError::ConcurrentReconciliationInProgress { .. }))) => {
                warn!("Rejected trigger for {project_id}: {err}");
                Ok(RunSummary::rejected(project_id, commit_sha, err.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    async fn notify(&self, summary: &RunSummary) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let Some(manifest) = self.config.project(&summary.project_id) else {
            return;
        };
        if let Some(channel) = &manifest.notification {
            notifier.notify(channel, &manifest.app.name, summary).await;
        }
    }

    /// Builds the plan a trigger would execute, without taking the lease.
    ///
    /// # Errors
    ///
    /// Returns configuration, planning and state store errors.
    pub async fn preview(&self, project_id: &str, repository_ref: &str, commit_sha: &str) -> Result<Plan> {
        let desired = self.prepare(project_id, repository_ref, commit_sha)?;
        self.reconciler
            .plan(project_id, &desired.descriptors, &desired.removals)
            .await
    }

    fn prepare(&self, project_id: &str, repository_ref: &str, commit_sha: &str) -> Result<DesiredState> {
        let manifest = self
            .config
            .project(project_id)
            .ok_or_else(|| ConfigError::UnknownProject {
                project: project_id.to_string(),
            })?;

        if commit_sha.trim().is_empty() {
            return Err(ConfigError::validation("Commit SHA cannot be empty", "commit_sha").into());
        }

        let reference = RepositoryRef::parse(repository_ref);
        if !tracks(manifest, &reference) {
            return Err(ConfigError::validation(
                format!("{reference} is not tracked by project {project_id}"),
                "repository_ref",
            )
            .into());
        }

        self.desired_state(manifest, commit_sha)
    }

    /// Builds the desired descriptor set for a manifest at a commit.
    ///
    /// # Errors
    ///
    /// Returns `MissingEnvVar` when a secret's source variable is unset.
    pub fn desired_state(&self, manifest: &ProjectManifest, commit_sha: &str) -> Result<DesiredState> {
        let mut descriptors = vec![
            ResourceDescriptor::builder(ResourceKind::Project, &manifest.id)
                .set("display_name", manifest.display_name.as_deref().unwrap_or(&manifest.id))
                .set("region", manifest.region.as_str())
                .set("labels", json!(manifest.labels))
                .build(),
        ];

        descriptors.extend(role_bindings(manifest));

        let image_repository = self.config.image_repository(manifest);
        let app = &manifest.app;
        let mut substitutions = app.build.substitutions.clone();
        substitutions.insert(String::from("_SERVICE"), app.name.clone());
        substitutions.insert(String::from("_REGION"), manifest.region.clone());
        descriptors.push(
            ResourceDescriptor::builder(ResourceKind::BuildTrigger, &app.name)
                .set("repository", app.repository.as_str())
                .set("image", image_repository.as_str())
                .set_opt("branch", app.build.branch.as_deref())
                .set_opt("tag", app.build.tag.as_deref())
                .set("buildpack", app.build.build_pack.as_str())
                .set("substitutions", json!(substitutions))
                .build(),
        );

        let connection = manifest.database.as_ref().map(|db| db.connection_name(manifest));
        if let Some(db) = &manifest.database {
            descriptors.push(
                ResourceDescriptor::builder(ResourceKind::DatabaseInstance, &db.instance)
                    .set("engine_version", db.engine_version.as_str())
                    .set("region", db.region.as_deref().unwrap_or(&manifest.region))
                    .set("tier", db.tier.as_str())
                    .set("high_availability", db.high_availability)
                    .set("database", db.name.as_str())
                    .set("user", db.user())
                    .build(),
            );
        }

        let mut mounted = BTreeMap::new();
        for secret in &manifest.secrets {
            let builder = ResourceDescriptor::builder(ResourceKind::Secret, &secret.name);
            let builder = match (&secret.from_env, &secret.generate) {
                (Some(var), _) => {
                    let value = (self.env)(var).ok_or_else(|| ConfigError::MissingEnvVar { name: var.clone() })?;
                    builder.set("value", value)
                }
                (None, Some(generate)) => builder.set("generate", generate.length),
                (None, None) => builder,
            };
            descriptors.push(builder.build());

            if let Some(var) = &secret.expose_as {
                mounted.insert(var.clone(), secret.name.clone());
            }
        }

        for topic in &manifest.topics {
            descriptors.push(
                ResourceDescriptor::builder(ResourceKind::Topic, &topic.name)
                    .set("labels", json!(topic.labels))
                    .set_opt("retention", topic.retention.as_deref())
                    .build(),
            );
        }

        let service = &app.service;
        let mut labels = manifest.labels.clone();
        labels.insert(String::from("revision"), commit_sha.to_string());
        descriptors.push(
            ResourceDescriptor::builder(ResourceKind::ServiceDeployment, &app.name)
                .set("image", format!("{image_repository}:{commit_sha}"))
                .set("region", manifest.region.as_str())
                .set("cpu", service.cpu)
                .set("memory", format!("{}Mi", service.memory_mb))
                .set("min_instances", service.min_instances)
                .set("max_instances", service.max_instances.max(1))
                .set("concurrency", service.concurrency)
                .set("timeout_secs", service.timeout_secs)
                .set("authenticated", service.authenticated)
                .set("env", json!(service.env))
                .set("secrets", json!(mounted))
                .set_opt("database", connection)
                .set("labels", json!(labels))
                .build(),
        );

        for domain in &manifest.domains {
            descriptors.push(
                ResourceDescriptor::builder(ResourceKind::DnsRecord, &domain.name)
                    .set_opt("zone", domain.zone.as_deref())
                    .set("target", SERVING_FRONT_DOOR)
                    .set("ttl", domain.ttl)
                    .build(),
            );
        }

        let removals = manifest
            .removed
            .iter()
            .map(|r| RemovalMarker::new(r.kind, r.identity.clone()))
            .collect();

        Ok(DesiredState { descriptors, removals })
    }
}

impl std::fmt::Debug for DeploymentTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentTrigger")
            .field("projects", &self.config.projects.len())
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

/// One binding per role; the app service account always holds the invoker role.
fn role_bindings(manifest: &ProjectManifest) -> Vec<ResourceDescriptor> {
    let account = manifest.service_account();
    let mut roles: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    roles.entry(INVOKER_ROLE).or_default().insert(&account);

    for grant in &manifest.roles {
        let members = roles.entry(grant.role.as_str()).or_default();
        members.insert(&account);
        members.extend(grant.members.iter().map(String::as_str));
    }

    roles
        .into_iter()
        .map(|(role, members)| {
            ResourceDescriptor::builder(ResourceKind::IamBinding, binding_identity(role))
                .set("role", role)
                .set("members", json!(members))
                .build()
        })
        .collect()
}

/// Path-safe identity for a role, e.g. `roles/run.invoker` becomes `run-invoker`.
fn binding_identity(role: &str) -> String {
    role.trim_start_matches("roles/").replace(['/', '.'], "-")
}

fn tracks(manifest: &ProjectManifest, reference: &RepositoryRef) -> bool {
    match (reference, &manifest.app.build.branch, &manifest.app.build.tag) {
        (RepositoryRef::Branch(name), Some(pattern), _) | (RepositoryRef::Tag(name), _, Some(pattern)) => {
            matches_pattern(pattern, name)
        }
        _ => false,
    }
}

/// Exact match, or prefix match for patterns ending in `*` or `.*`.
fn matches_pattern(pattern: &str, value: &str) -> bool {
    let pattern = pattern.trim_start_matches('^').trim_end_matches('$');
    match pattern.strip_suffix(".*").or_else(|| pattern.strip_suffix('*')) {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}
