//! Configuration validation.
//!
//! Collects every problem in one pass so operators can fix a manifest without
//! repeated round trips.

use crate::error::{ConfigError, PilotError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    AppManifest, DomainManifest, PilotConfig, ProjectManifest, ProviderConfig, RetryConfig, SecretManifest,
    StateBackend, StateConfig,
};

/// Validator for operator configuration.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails. Use [`Self::check`] to get all of them.
    pub fn validate(&self, config: &PilotConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(PilotError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all errors and warnings.
    #[must_use]
    pub fn check(&self, config: &PilotConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_retry(&config.retry, &mut result);
        if config.lease.ttl_secs == 0 {
            result.error("lease.ttl_secs", "Lease TTL must be at least one second");
        }
        Self::validate_projects(&config.projects, &mut result);

        result
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
            }
            StateBackend::Memory => {
                result
                    .warnings
                    .push(String::from("Memory state backend keeps no state between invocations"));
            }
            StateBackend::Local => {}
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        if !(provider.base_url.starts_with("http://") || provider.base_url.starts_with("https://")) {
            result.error(
                "provider.base_url",
                format!("Gateway URL '{}' must start with http:// or https://", provider.base_url),
            );
        }
        if provider.timeout_secs == 0 {
            result.error("provider.timeout_secs", "Request timeout must be at least one second");
        }
    }

    fn validate_retry(retry: &RetryConfig, result: &mut ValidationResult) {
        if retry.max_attempts == 0 {
            result.error("retry.max_attempts", "At least one attempt is required");
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            result.warnings.push(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({}); every delay will be capped",
                retry.base_delay_ms, retry.max_delay_ms
            ));
        }
    }

    fn validate_projects(projects: &[ProjectManifest], result: &mut ValidationResult) {
        if projects.is_empty() {
            result.warnings.push(String::from("No projects defined in configuration"));
            return;
        }

        let mut seen = HashSet::new();
        for (i, project) in projects.iter().enumerate() {
            let prefix = format!("projects[{i}]");

            if !seen.insert(project.id.as_str()) {
                result.error(format!("{prefix}.id"), format!("Duplicate project id: {}", project.id));
            }
            check_name(&project.id, &format!("{prefix}.id"), "Project id", result);

            for (j, grant) in project.roles.iter().enumerate() {
                if grant.role.trim().is_empty() {
                    result.error(format!("{prefix}.roles[{j}].role"), "Role cannot be empty");
                }
            }

            Self::validate_app(&project.app, &prefix, result);
            Self::validate_secrets(&project.secrets, &prefix, result);

            if let Some(db) = &project.database {
                check_name(&db.instance, &format!("{prefix}.database.instance"), "Database instance", result);
            }

            let mut topics = HashSet::new();
            for (j, topic) in project.topics.iter().enumerate() {
                let field = format!("{prefix}.topics[{j}].name");
                if !topics.insert(topic.name.as_str()) {
                    result.error(&field, format!("Duplicate topic: {}", topic.name));
                }
                check_name(&topic.name, &field, "Topic name", result);
            }

            Self::validate_domains(&project.domains, &prefix, result);

            if let Some(channel) = &project.notification {
                if !channel.webhook_url.starts_with("https://") {
                    result.error(
                        format!("{prefix}.notification.webhook_url"),
                        "Chat webhook URL must start with https://",
                    );
                }
                if channel.notify_on.is_empty() {
                    result.warnings.push(format!("{prefix}.notification.notify_on is empty; nothing will be sent"));
                }
            }

            for (j, removed) in project.removed.iter().enumerate() {
                if removed.identity.trim().is_empty() {
                    result.error(format!("{prefix}.removed[{j}].identity"), "Removed resource needs an identity");
                }
            }
        }
    }

    fn validate_app(app: &AppManifest, prefix: &str, result: &mut ValidationResult) {
        check_name(&app.name, &format!("{prefix}.app.name"), "App name", result);

        if app.repository.trim().is_empty() {
            result.error(format!("{prefix}.app.repository"), "Repository cannot be empty");
        }

        match (&app.build.branch, &app.build.tag) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => result.error(
                format!("{prefix}.app.build"),
                "Exactly one of branch or tag must be provided",
            ),
        }

        let service = &app.service;
        if service.max_instances == 0 {
            result.error(format!("{prefix}.app.service.max_instances"), "At least one instance is required");
        } else if service.min_instances > service.max_instances {
            result.error(
                format!("{prefix}.app.service.min_instances"),
                format!(
                    "min_instances ({}) exceeds max_instances ({})",
                    service.min_instances, service.max_instances
                ),
            );
        }
        if service.cpu == 0 || service.memory_mb == 0 {
            result.error(format!("{prefix}.app.service"), "CPU and memory must be positive");
        }
    }

    fn validate_secrets(secrets: &[SecretManifest], prefix: &str, result: &mut ValidationResult) {
        let mut names = HashSet::new();
        for (i, secret) in secrets.iter().enumerate() {
            let field = format!("{prefix}.secrets[{i}]");
            if !names.insert(secret.name.as_str()) {
                result.error(format!("{field}.name"), format!("Duplicate secret: {}", secret.name));
            }
            check_name(&secret.name, &format!("{field}.name"), "Secret name", result);

            match (&secret.from_env, &secret.generate) {
                (Some(_), None) => {}
                (None, Some(generate)) if generate.length == 0 => {
                    result.error(format!("{field}.generate.length"), "Generated secrets need a positive length");
                }
                (None, Some(_)) => {}
                _ => result.error(&field, "Exactly one of from_env or generate must be provided"),
            }
        }
    }

    fn validate_domains(domains: &[DomainManifest], prefix: &str, result: &mut ValidationResult) {
        let mut names = HashSet::new();
        for (i, domain) in domains.iter().enumerate() {
            let field = format!("{prefix}.domains[{i}]");
            if !names.insert(domain.name.to_ascii_lowercase()) {
                result.error(format!("{field}.name"), format!("Duplicate domain: {}", domain.name));
            }
            if !domain.name.contains('.') {
                result.error(format!("{field}.name"), format!("'{}' is not a fully qualified domain", domain.name));
            }
            if domain.zone.as_deref().is_none_or(str::is_empty) {
                result.error(format!("{field}.zone"), format!("Domain '{}' requires a DNS zone", domain.name));
            }
        }
    }
}

fn check_name(name: &str, field: &str, what: &str, result: &mut ValidationResult) {
    if name.is_empty() {
        result.error(field, format!("{what} cannot be empty"));
    } else if !is_valid_name(name) {
        result.error(
            field,
            format!("{what} '{name}' is invalid. Must be lowercase alphanumeric with hyphens."),
        );
    }
}

/// Checks that `name` is a lowercase DNS label.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
        && name.len() <= 63
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
