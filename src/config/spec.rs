//! Configuration types for operator settings and project manifests.
//!
//! This module defines the structs that map to `provision-pilot.yaml`: operator
//! settings (state backend, provisioning gateway, retry and lease policy) and
//! one manifest per managed project describing the resources it should have.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::reconciler::{RetryPolicy, RunStatus};
use crate::resource::ResourceKind;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PilotConfig {
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provisioning gateway configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Retry policy for transient driver failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Project lease settings.
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Container registry prefix for built images. Defaults to `gcr.io/<project>`.
    #[serde(default)]
    pub registry: Option<String>,
    /// Managed projects.
    #[serde(default)]
    pub projects: Vec<ProjectManifest>,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region. Uses the AWS default chain when unset.
    #[serde(default)]
    pub region: Option<String>,
    /// Base directory for the local backend.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Process memory. Lost on exit.
    Memory,
    /// JSON files on the local disk.
    #[default]
    Local,
    /// AWS S3 with conditional writes.
    S3,
}

/// Provisioning gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Gateway base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

/// Retry policy settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failure in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for computed delays in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Lease settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Lease time-to-live in seconds.
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,
    /// Optional limit on how long a run keeps starting operations.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

/// Desired state of one project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectManifest {
    /// Project identifier.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Default region for regional resources.
    #[serde(default = "default_region")]
    pub region: String,
    /// Project labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Role grants. Each role becomes one binding.
    #[serde(default)]
    pub roles: Vec<RoleGrant>,
    /// The application built and served in this project.
    pub app: AppManifest,
    /// Optional managed database.
    #[serde(default)]
    pub database: Option<DatabaseManifest>,
    /// Secrets exposed to the service.
    #[serde(default)]
    pub secrets: Vec<SecretManifest>,
    /// Messaging topics.
    #[serde(default)]
    pub topics: Vec<TopicManifest>,
    /// Custom domains pointing at the service.
    #[serde(default)]
    pub domains: Vec<DomainManifest>,
    /// Resources to delete.
    #[serde(default)]
    pub removed: Vec<RemovedResource>,
    /// Chat channel told about finished runs.
    #[serde(default)]
    pub notification: Option<NotificationConfig>,
}

/// Chat webhook notified after each trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationConfig {
    /// Incoming webhook URL of the chat space.
    pub webhook_url: String,
    /// Run statuses that produce a message.
    #[serde(default = "default_notify_on")]
    pub notify_on: Vec<RunStatus>,
}

/// One role granted to a set of members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleGrant {
    /// Role name, e.g. `roles/run.invoker`.
    pub role: String,
    /// Extra members besides the app service account.
    #[serde(default)]
    pub members: Vec<String>,
}

/// Application build and serving settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppManifest {
    /// Application name. Names the build trigger and the service.
    pub name: String,
    /// Source repository.
    pub repository: String,
    /// Build settings.
    pub build: BuildManifest,
    /// Serving settings.
    #[serde(default)]
    pub service: ServiceManifest,
}

/// Build trigger settings. Exactly one of `branch` or `tag` is tracked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildManifest {
    /// Tracked branch.
    #[serde(default)]
    pub branch: Option<String>,
    /// Tracked tag pattern.
    #[serde(default)]
    pub tag: Option<String>,
    /// Build pack name.
    #[serde(default = "default_build_pack")]
    pub build_pack: String,
    /// Extra build substitutions.
    #[serde(default)]
    pub substitutions: BTreeMap<String, String>,
}

/// Serving settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceManifest {
    /// CPU cores.
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Memory in MiB.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    /// Minimum instances.
    #[serde(default)]
    pub min_instances: u32,
    /// Maximum instances.
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    /// Concurrent requests per instance.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u32,
    /// Whether callers must authenticate.
    #[serde(default = "default_true")]
    pub authenticated: bool,
    /// Plain environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Managed database settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseManifest {
    /// Instance name.
    pub instance: String,
    /// Database name.
    pub name: String,
    /// Database user. Defaults to `app.<name>`.
    #[serde(default)]
    pub user: Option<String>,
    /// Engine version.
    #[serde(default = "default_engine_version")]
    pub engine_version: String,
    /// Machine tier.
    #[serde(default = "default_tier")]
    pub tier: String,
    /// Region. Defaults to the project region.
    #[serde(default)]
    pub region: Option<String>,
    /// Regional high availability.
    #[serde(default)]
    pub high_availability: bool,
}

/// A secret and where its value comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretManifest {
    /// Secret name.
    pub name: String,
    /// Environment variable read at trigger time.
    #[serde(default)]
    pub from_env: Option<String>,
    /// Generate a random value once, on creation.
    #[serde(default)]
    pub generate: Option<GenerateSpec>,
    /// Service environment variable the secret is mounted as.
    #[serde(default)]
    pub expose_as: Option<String>,
}

/// Generated secret settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerateSpec {
    /// Number of characters.
    #[serde(default = "default_secret_length")]
    pub length: u32,
}

/// Messaging topic settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicManifest {
    /// Topic name.
    pub name: String,
    /// Message retention, e.g. `86400s`.
    #[serde(default)]
    pub retention: Option<String>,
    /// Topic labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Custom domain settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainManifest {
    /// Fully qualified domain name.
    pub name: String,
    /// Managed DNS zone.
    #[serde(default)]
    pub zone: Option<String>,
    /// Record time-to-live in seconds.
    #[serde(default = "default_dns_ttl")]
    pub ttl: u32,
}

/// A resource the operator wants deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemovedResource {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource identity.
    pub identity: String,
}

// Default value functions

fn default_base_url() -> String {
    String::from("http://localhost:8080")
}

const fn default_timeout_secs() -> u64 {
    30
}

fn default_token_env() -> String {
    String::from("PILOT_API_TOKEN")
}

const fn default_max_attempts() -> u32 {
    crate::reconciler::DEFAULT_MAX_ATTEMPTS
}

const fn default_base_delay_ms() -> u64 {
    crate::reconciler::DEFAULT_BASE_DELAY_MS
}

const fn default_max_delay_ms() -> u64 {
    crate::reconciler::DEFAULT_MAX_DELAY_MS
}

const fn default_lease_ttl() -> u64 {
    crate::state::DEFAULT_LEASE_TTL_SECS
}

fn default_notify_on() -> Vec<RunStatus> {
    vec![RunStatus::Succeeded, RunStatus::PartiallyFailed, RunStatus::Failed]
}

fn default_region() -> String {
    String::from("us-central1")
}

fn default_build_pack() -> String {
    String::from("python")
}

const fn default_cpu() -> u32 {
    1
}

const fn default_memory_mb() -> u32 {
    256
}

const fn default_max_instances() -> u32 {
    10
}

const fn default_concurrency() -> u32 {
    80
}

const fn default_request_timeout() -> u32 {
    900
}

const fn default_true() -> bool {
    true
}

fn default_engine_version() -> String {
    String::from("POSTGRES_13")
}

fn default_tier() -> String {
    String::from("db-f1-micro")
}

const fn default_secret_length() -> u32 {
    32
}

const fn default_dns_ttl() -> u32 {
    300
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            token_env: default_token_env(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl(),
            run_timeout_secs: None,
        }
    }
}

impl Default for ServiceManifest {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory_mb: default_memory_mb(),
            min_instances: 0,
            max_instances: default_max_instances(),
            concurrency: default_concurrency(),
            timeout_secs: default_request_timeout(),
            authenticated: true,
            env: BTreeMap::new(),
        }
    }
}

impl PilotConfig {
    /// Finds the manifest of a project.
    #[must_use]
    pub fn project(&self, id: &str) -> Option<&ProjectManifest> {
        self.projects.iter().find(|p| p.id == id)
    }

    /// Image repository for an app, without tag.
    #[must_use]
    pub fn image_repository(&self, project: &ProjectManifest) -> String {
        let registry = self
            .registry
            .clone()
            .unwrap_or_else(|| format!("gcr.io/{}", project.id));
        format!("{}/{}", registry.trim_end_matches('/'), project.app.name)
    }
}

impl ProviderConfig {
    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RetryConfig {
    /// Converts the settings into a retry policy.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl LeaseConfig {
    /// Lease time-to-live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl ProjectManifest {
    /// Service account the app runs as.
    #[must_use]
    pub fn service_account(&self) -> String {
        format!("serviceAccount:{}@{}.iam.gserviceaccount.com", self.app.name, self.id)
    }
}

impl NotificationConfig {
    /// Whether a run ending in `status` should be announced.
    #[must_use]
    pub fn wants(&self, status: RunStatus) -> bool {
        self.notify_on.contains(&status)
    }
}

impl DatabaseManifest {
    /// Database user, defaulting to `app.<name>`.
    #[must_use]
    pub fn user(&self) -> String {
        self.user.clone().unwrap_or_else(|| format!("app.{}", self.name))
    }

    /// Connection name used by the service to reach the instance.
    #[must_use]
    pub fn connection_name(&self, project: &ProjectManifest) -> String {
        let region = self.region.as_deref().unwrap_or(&project.region);
        format!("{}:{region}:{}", project.id, self.instance)
    }
}
