//! Resource drivers.
//!
//! One driver per [`ResourceKind`], each a standalone struct implementing
//! [`ResourceDriver`]. Drivers translate an abstract desired configuration into
//! a provider payload and carry no knowledge of other resources.

mod client;
mod kinds;
mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::resource::{DesiredConfig, ResourceDescriptor, ResourceKind};

pub use client::{DEFAULT_TIMEOUT_SECS, ProvisioningClient};
pub use kinds::{
    BuildTriggerDriver, DatabaseInstanceDriver, DnsRecordDriver, IamBindingDriver, ProjectDriver, SecretDriver,
    ServiceDeploymentDriver, TopicDriver,
};
pub use registry::{DriverRegistry, DriverRegistryBuilder};

/// Result type for driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Provider-side handle of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderHandle {
    /// Provider identifier.
    pub id: String,
    /// Attributes as reported by the provider.
    #[serde(default)]
    pub attributes: DesiredConfig,
}

impl ProviderHandle {
    /// Creates a handle without attributes.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: DesiredConfig::new(),
        }
    }
}

/// Capability set every resource driver implements.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    /// Kind handled by this driver.
    fn kind(&self) -> ResourceKind;

    /// Reads the live state of a resource. Read-only; diagnostic use only.
    async fn describe_current(&self, project: &str, identity: &str) -> DriverResult<ProviderHandle>;

    /// Creates the resource described by `descriptor`.
    async fn create(&self, project: &str, descriptor: &ResourceDescriptor) -> DriverResult<ProviderHandle>;

    /// Updates the resource in place to match `descriptor`.
    async fn update(&self, project: &str, descriptor: &ResourceDescriptor) -> DriverResult<ProviderHandle>;

    /// Deletes the resource.
    async fn delete(&self, project: &str, identity: &str) -> DriverResult<()>;
}
