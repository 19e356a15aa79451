//! Desired resource descriptors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::checksum::ConfigHasher;
use super::kind::ResourceKind;

/// Desired configuration of a resource: unique keys mapped to JSON values.
pub type DesiredConfig = BTreeMap<String, serde_json::Value>;

/// Natural key of a resource within a project.
///
/// Ordered by kind first, then identity, which is the deterministic plan order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Stable identity, unique within (project, kind).
    pub identity: String,
}

impl ResourceKey {
    /// Creates a new resource key.
    #[must_use]
    pub fn new(kind: ResourceKind, identity: impl Into<String>) -> Self {
        Self {
            kind,
            identity: identity.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.identity)
    }
}

/// Immutable description of one desired resource.
///
/// The checksum is computed once at construction and always reflects `config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    key: ResourceKey,
    config: DesiredConfig,
    checksum: String,
}

impl ResourceDescriptor {
    /// Creates a descriptor and computes its checksum.
    #[must_use]
    pub fn new(kind: ResourceKind, identity: impl Into<String>, config: DesiredConfig) -> Self {
        let checksum = ConfigHasher::new().checksum(&config);
        Self {
            key: ResourceKey::new(kind, identity),
            config,
            checksum,
        }
    }

    /// Starts building a descriptor one configuration entry at a time.
    #[must_use]
    pub fn builder(kind: ResourceKind, identity: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            kind,
            identity: identity.into(),
            config: DesiredConfig::new(),
        }
    }

    /// Descriptor carried by a `Delete` operation. Its configuration is empty.
    #[must_use]
    pub fn tombstone(key: &ResourceKey) -> Self {
        Self::new(key.kind, key.identity.clone(), DesiredConfig::new())
    }

    /// Resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.key.kind
    }

    /// Resource identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.key.identity
    }

    /// Natural key of the resource.
    #[must_use]
    pub const fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Desired configuration.
    #[must_use]
    pub const fn config(&self) -> &DesiredConfig {
        &self.config
    }

    /// Content hash of the desired configuration.
    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Returns a string value from the configuration.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(serde_json::Value::as_str)
    }
}

/// Incremental builder for [`ResourceDescriptor`].
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    kind: ResourceKind,
    identity: String,
    config: DesiredConfig,
}

impl DescriptorBuilder {
    /// Sets a configuration entry, replacing any previous value for `key`.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Sets a configuration entry only when a value is present.
    #[must_use]
    pub fn set_opt<V: Into<serde_json::Value>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    /// Finishes the descriptor.
    #[must_use]
    pub fn build(self) -> ResourceDescriptor {
        ResourceDescriptor::new(self.kind, self.identity, self.config)
    }
}

/// Explicit request to delete a previously applied resource.
///
/// Absence from a desired set never implies deletion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemovalMarker {
    /// Key of the resource to remove.
    pub key: ResourceKey,
}

impl RemovalMarker {
    /// Creates a removal marker.
    #[must_use]
    pub fn new(kind: ResourceKind, identity: impl Into<String>) -> Self {
        Self {
            key: ResourceKey::new(kind, identity),
        }
    }
}
