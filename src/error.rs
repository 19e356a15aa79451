//! Error types for the provisioning engine.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation: configuration, state persistence, resource drivers,
//! planning, and plan execution.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::resource::ResourceKind;

/// The main error type for the provisioning engine.
#[derive(Debug, Error)]
pub enum PilotError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State store errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Resource driver errors.
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// No manifest is configured for the project.
    #[error("Unknown project: {project}")]
    UnknownProject {
        /// The requested project identifier.
        project: String,
    },
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// The backing store could not be reached or failed an operation.
    #[error("State store unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// Stored data could not be decoded.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// The project lease is held by someone else and has not expired.
    #[error("Lease for project {project} is held by {holder} until {expires_at}")]
    LeaseBusy {
        /// Project the lease guards.
        project: String,
        /// Current lease holder.
        holder: String,
        /// Expiry of the current lease (RFC 3339).
        expires_at: String,
    },

    /// The lease presented no longer matches the stored lease.
    #[error("Lease {lease_id} for project {project} is no longer held")]
    LeaseNotHeld {
        /// Project the lease guards.
        project: String,
        /// Identifier of the stale lease.
        lease_id: String,
    },
}

/// Classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retrying may succeed (timeouts, rate limits, temporary conflicts).
    Transient,
    /// Retrying cannot succeed without a configuration or dependency change.
    Permanent,
}

/// Errors reported by resource drivers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// The resource does not exist.
    #[error("{kind} '{identity}' not found")]
    NotFound {
        /// Resource kind.
        kind: ResourceKind,
        /// Resource identity.
        identity: String,
    },

    /// The resource already exists with different content.
    #[error("{kind} '{identity}' already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: ResourceKind,
        /// Resource identity.
        identity: String,
    },

    /// The provider refused the request because a quota is exhausted.
    #[error("Quota exceeded: {message}")]
    QuotaExceeded {
        /// Provider message.
        message: String,
    },

    /// The resource cannot be deleted while dependents exist.
    #[error("{kind} '{identity}' still has dependent resources")]
    DependentResourceExists {
        /// Resource kind.
        kind: ResourceKind,
        /// Resource identity.
        identity: String,
    },

    /// The desired configuration is invalid for this kind.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Credentials were rejected.
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Provider message.
        message: String,
    },

    /// The provider is throttling requests.
    #[error("Rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The request timed out.
    #[error("Request timed out: {message}")]
    Timeout {
        /// Description of the timeout.
        message: String,
    },

    /// A concurrent change on the provider side conflicted with this one.
    #[error("Temporary conflict: {message}")]
    Conflict {
        /// Provider message.
        message: String,
    },

    /// The provider returned a server error.
    #[error("Provider unavailable ({status}): {message}")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Provider message.
        message: String,
    },

    /// Transport failure.
    #[error("Network error: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// The provider answered with something that could not be understood.
    #[error("Invalid provider response: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Planning errors. A plan that fails to build never starts a run.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Two descriptors share a (kind, identity) pair with different configuration,
    /// or a descriptor is both desired and marked for removal.
    #[error("Conflicting descriptors for {kind} '{identity}': {message}")]
    DescriptorConflict {
        /// Resource kind.
        kind: ResourceKind,
        /// Resource identity.
        identity: String,
        /// Description of the conflict.
        message: String,
    },

    /// A descriptor requires a predecessor kind that is absent from the desired set.
    #[error("{kind} '{identity}' requires a {missing} descriptor")]
    UnresolvedDependency {
        /// Kind of the dependent descriptor.
        kind: ResourceKind,
        /// Identity of the dependent descriptor.
        identity: String,
        /// The missing predecessor kind.
        missing: ResourceKind,
    },
}

/// Reconciliation errors surfaced to the caller as hard failures.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Another run holds the project lease.
    #[error("Reconciliation already in progress for project {project} (holder: {holder})")]
    ConcurrentReconciliationInProgress {
        /// Project being reconciled.
        project: String,
        /// Current lease holder.
        holder: String,
    },

    /// The run lost its lease and was abandoned.
    #[error("Lease lost for project {project}")]
    LeaseLost {
        /// Project being reconciled.
        project: String,
    },

    /// Progress can no longer be recorded.
    #[error("State store unavailable during run for project {project}: {message}")]
    StateStoreUnavailable {
        /// Project being reconciled.
        project: String,
        /// Underlying failure.
        message: String,
    },
}

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, PilotError>;

impl PilotError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if the caller may retry the whole request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Reconcile(
                ReconcileError::ConcurrentReconciliationInProgress { .. }
                    | ReconcileError::StateStoreUnavailable { .. }
                    | ReconcileError::LeaseLost { .. }
            ) | Self::State(StateError::Unavailable { .. } | StateError::LeaseBusy { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an unavailable error with the given message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl DriverError {
    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Classifies the failure for retry purposes.
    ///
    /// `AlreadyExists` is transient: the next attempt re-reads the resource and
    /// accepts it when the content matches.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::AlreadyExists { .. }
            | Self::RateLimited { .. }
            | Self::Timeout { .. }
            | Self::Conflict { .. }
            | Self::Unavailable { .. }
            | Self::Network { .. } => FailureClass::Transient,
            Self::NotFound { .. }
            | Self::QuotaExceeded { .. }
            | Self::DependentResourceExists { .. }
            | Self::InvalidConfig { .. }
            | Self::PermissionDenied { .. }
            | Self::InvalidResponse { .. } => FailureClass::Permanent,
        }
    }

    /// Returns true if the failure is worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.class(), FailureClass::Transient)
    }

    /// Returns the provider's suggested minimum delay before retrying, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        };
        write!(f, "{s}")
    }
}
