//! Resource kinds and their fixed dependency ordering.
//!
//! The set of kinds is closed and the ordering between them is domain
//! knowledge of this system, never user supplied.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A kind of managed cloud resource.
///
/// Variants are declared in a topological order of the dependency table, so the
/// derived `Ord` is a total order consistent with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// The cloud project hosting everything else.
    Project,
    /// A role binding granting members a role on the project.
    IamBinding,
    /// The build pipeline trigger for a repository.
    BuildTrigger,
    /// A managed database instance.
    DatabaseInstance,
    /// A secret in the secret store.
    Secret,
    /// A pub/sub topic.
    Topic,
    /// A deployed serving revision.
    ServiceDeployment,
    /// A DNS record pointing at a service.
    DnsRecord,
}

impl ResourceKind {
    /// Number of kinds.
    pub const COUNT: usize = 8;

    /// All kinds, in dependency order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Project,
        Self::IamBinding,
        Self::BuildTrigger,
        Self::DatabaseInstance,
        Self::Secret,
        Self::Topic,
        Self::ServiceDeployment,
        Self::DnsRecord,
    ];

    /// Kinds that must be applied before this one when both are present.
    #[must_use]
    pub const fn predecessors(self) -> &'static [Self] {
        match self {
            Self::Project => &[],
            Self::IamBinding => &[Self::Project],
            Self::BuildTrigger => &[Self::Project, Self::IamBinding],
            Self::DatabaseInstance | Self::Secret | Self::Topic => &[Self::IamBinding],
            Self::ServiceDeployment => &[
                Self::IamBinding,
                Self::BuildTrigger,
                Self::DatabaseInstance,
                Self::Secret,
            ],
            Self::DnsRecord => &[Self::ServiceDeployment],
        }
    }

    /// Kinds that must be present in a desired set whenever this kind is.
    ///
    /// A subset of [`Self::predecessors`]: a service may run without a
    /// database, secrets, or a build trigger, but never without bindings.
    #[must_use]
    pub const fn required_predecessors(self) -> &'static [Self] {
        match self {
            Self::Project => &[],
            Self::IamBinding => &[Self::Project],
            Self::BuildTrigger
            | Self::DatabaseInstance
            | Self::Secret
            | Self::Topic
            | Self::ServiceDeployment => &[Self::IamBinding],
            Self::DnsRecord => &[Self::ServiceDeployment],
        }
    }

    /// Returns true if `self` precedes `other`, directly or transitively.
    #[must_use]
    pub fn is_ancestor_of(self, other: Self) -> bool {
        other
            .predecessors()
            .iter()
            .any(|&p| p == self || self.is_ancestor_of(p))
    }

    /// Returns every kind that `self` transitively depends on.
    #[must_use]
    pub fn ancestors(self) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|k| k.is_ancestor_of(self))
            .collect()
    }

    /// Position of the kind in [`Self::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Stable lowercase name used in keys and output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::IamBinding => "iam_binding",
            Self::BuildTrigger => "build_trigger",
            Self::DatabaseInstance => "database_instance",
            Self::Secret => "secret",
            Self::Topic => "topic",
            Self::ServiceDeployment => "service_deployment",
            Self::DnsRecord => "dns_record",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("Unknown resource kind: {s}"))
    }
}
