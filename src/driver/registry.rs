//! Fixed table of drivers, one per resource kind.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{PilotError, Result};
use crate::resource::ResourceKind;

use super::ResourceDriver;
use super::client::ProvisioningClient;
use super::kinds::{
    BuildTriggerDriver, DatabaseInstanceDriver, DnsRecordDriver, IamBindingDriver, ProjectDriver, SecretDriver,
    ServiceDeploymentDriver, TopicDriver,
};

/// Every resource kind mapped to exactly one driver.
#[derive(Clone)]
pub struct DriverRegistry {
    drivers: [Arc<dyn ResourceDriver>; ResourceKind::COUNT],
}

impl DriverRegistry {
    /// Starts an empty registry builder.
    #[must_use]
    pub fn builder() -> DriverRegistryBuilder {
        DriverRegistryBuilder::default()
    }

    /// Builds the registry of HTTP drivers sharing one gateway client.
    #[must_use]
    pub fn http(client: &ProvisioningClient) -> Self {
        Self {
            drivers: [
                Arc::new(ProjectDriver::new(client.clone())),
                Arc::new(IamBindingDriver::new(client.clone())),
                Arc::new(BuildTriggerDriver::new(client.clone())),
                Arc::new(DatabaseInstanceDriver::new(client.clone())),
                Arc::new(SecretDriver::new(client.clone())),
                Arc::new(TopicDriver::new(client.clone())),
                Arc::new(ServiceDeploymentDriver::new(client.clone())),
                Arc::new(DnsRecordDriver::new(client.clone())),
            ],
        }
    }

    /// Returns the driver for a kind.
    #[must_use]
    pub fn get(&self, kind: ResourceKind) -> &dyn ResourceDriver {
        self.drivers[kind.index()].as_ref()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("kinds", &ResourceKind::ALL)
            .finish()
    }
}

/// Builder collecting one driver per kind.
#[derive(Default)]
pub struct DriverRegistryBuilder {
    drivers: BTreeMap<ResourceKind, Arc<dyn ResourceDriver>>,
}

impl DriverRegistryBuilder {
    /// Registers a driver under the kind it reports, replacing any previous one.
    #[must_use]
    pub fn register(mut self, driver: Arc<dyn ResourceDriver>) -> Self {
        self.drivers.insert(driver.kind(), driver);
        self
    }

    /// Finishes the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if any kind has no driver.
    pub fn build(mut self) -> Result<DriverRegistry> {
        let missing: Vec<String> = ResourceKind::ALL
            .iter()
            .filter(|k| !self.drivers.contains_key(*k))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(PilotError::internal(format!(
                "No driver registered for: {}",
                missing.join(", ")
            )));
        }

        let ordered: Vec<Arc<dyn ResourceDriver>> = ResourceKind::ALL
            .iter()
            .filter_map(|k| self.drivers.remove(k))
            .collect();
        let drivers = ordered
            .try_into()
            .map_err(|_| PilotError::internal("Driver table size mismatch"))?;

        Ok(DriverRegistry { drivers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockResourceDriver, ProviderHandle};
    use std::time::Duration;

    fn mock_for(kind: ResourceKind) -> Arc<dyn ResourceDriver> {
        let mut mock = MockResourceDriver::new();
        mock.expect_kind().return_const(kind);
        mock.expect_describe_current()
            .returning(move |_, identity| Ok(ProviderHandle::new(format!("{kind}:{identity}"))));
        Arc::new(mock)
    }

    #[test]
    fn test_builder_requires_every_kind() {
        let partial = DriverRegistry::builder()
            .register(mock_for(ResourceKind::Project))
            .build();
        assert!(partial.is_err());
    }

    #[tokio::test]
    async fn test_lookup_by_kind() {
        let registry = ResourceKind::ALL
            .into_iter()
            .fold(DriverRegistry::builder(), |b, k| b.register(mock_for(k)))
            .build()
            .expect("complete registry");

        for kind in ResourceKind::ALL {
            let driver = registry.get(kind);
            assert_eq!(driver.kind(), kind);
        }

        let handle = registry
            .get(ResourceKind::Secret)
            .describe_current("p1", "db")
            .await
            .expect("describe");
        assert_eq!(handle.id, "secret:db");
    }

    #[test]
    fn test_http_registry_is_complete() {
        let client = ProvisioningClient::new("http://localhost:1", None, Duration::from_secs(1)).expect("client");
        let registry = DriverRegistry::http(&client);

        for kind in ResourceKind::ALL {
            assert_eq!(registry.get(kind).kind(), kind);
        }
    }
}
