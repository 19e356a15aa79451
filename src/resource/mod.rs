//! Resource model: kinds, their fixed ordering, and desired descriptors.

mod checksum;
mod descriptor;
mod kind;

pub use checksum::ConfigHasher;
pub use descriptor::{DescriptorBuilder, DesiredConfig, RemovalMarker, ResourceDescriptor, ResourceKey};
pub use kind::ResourceKind;
