//! Configuration module.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `provision-pilot.yaml`
//! - Environment overrides and `.env` loading
//! - Validation of operator settings and project manifests

mod parser;
mod spec;
mod validator;

pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, config_dir, find_config_file};
pub use spec::{
    AppManifest, BuildManifest, DatabaseManifest, DomainManifest, GenerateSpec, LeaseConfig, NotificationConfig,
    PilotConfig, ProjectManifest, ProviderConfig, RemovedResource, RetryConfig, RoleGrant, SecretManifest,
    ServiceManifest, StateBackend, StateConfig, TopicManifest,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
