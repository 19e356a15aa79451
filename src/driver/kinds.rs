//! HTTP drivers, one struct per resource kind.
//!
//! Each driver owns the translation from the abstract desired configuration to
//! its gateway payload. The request plumbing is shared through [`HttpCore`].

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;

use crate::error::DriverError;
use crate::resource::{DesiredConfig, ResourceDescriptor, ResourceKind};

use super::client::ProvisioningClient;
use super::{DriverResult, ProviderHandle, ResourceDriver};

/// Which call a payload is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Create,
    Update,
}

/// Request plumbing shared by every HTTP driver.
#[derive(Debug, Clone)]
struct HttpCore {
    client: ProvisioningClient,
    kind: ResourceKind,
    collection: &'static str,
}

impl HttpCore {
    async fn describe(&self, project: &str, identity: &str) -> DriverResult<ProviderHandle> {
        self.client
            .describe(project, self.kind, self.collection, identity)
            .await
    }

    /// Creates the resource; on a conflict, adopts or updates the existing one.
    async fn create(
        &self,
        project: &str,
        identity: &str,
        create_payload: &DesiredConfig,
        update_payload: &DesiredConfig,
    ) -> DriverResult<ProviderHandle> {
        let created = self
            .client
            .create(project, self.kind, self.collection, identity, create_payload)
            .await;

        match created {
            Err(DriverError::AlreadyExists { kind, identity: id }) => {
                debug!("{kind} '{id}' already exists, comparing with desired payload");
                let existing = match self.describe(project, identity).await {
                    Ok(existing) => existing,
                    // deleted between the two calls; let the caller retry
                    Err(DriverError::NotFound { .. }) => {
                        return Err(DriverError::AlreadyExists { kind, identity: id });
                    }
                    Err(e) => return Err(e),
                };

                if existing.attributes == *update_payload {
                    info!("Adopted existing {kind} '{id}' ({})", existing.id);
                    Ok(existing)
                } else {
                    info!("Existing {kind} '{id}' differs, updating in place");
                    self.client
                        .update(project, self.kind, self.collection, identity, update_payload)
                        .await
                }
            }
            other => other,
        }
    }

    async fn update(&self, project: &str, identity: &str, payload: &DesiredConfig) -> DriverResult<ProviderHandle> {
        self.client
            .update(project, self.kind, self.collection, identity, payload)
            .await
    }

    async fn delete(&self, project: &str, identity: &str) -> DriverResult<()> {
        self.client
            .delete(project, self.kind, self.collection, identity)
            .await
    }
}

macro_rules! http_driver {
    ($(#[$doc:meta])* $name:ident, $kind:expr, $collection:literal, $payload:path) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            core: HttpCore,
        }

        impl $name {
            /// Creates the driver on top of a gateway client.
            #[must_use]
            pub fn new(client: ProvisioningClient) -> Self {
                Self {
                    core: HttpCore {
                        client,
                        kind: $kind,
                        collection: $collection,
                    },
                }
            }
        }

        #[async_trait]
        impl ResourceDriver for $name {
            fn kind(&self) -> ResourceKind {
                $kind
            }

            async fn describe_current(&self, project: &str, identity: &str) -> DriverResult<ProviderHandle> {
                self.core.describe(project, identity).await
            }

            async fn create(&self, project: &str, descriptor: &ResourceDescriptor) -> DriverResult<ProviderHandle> {
                let create_payload = $payload(descriptor, Mode::Create)?;
                let update_payload = $payload(descriptor, Mode::Update)?;
                self.core
                    .create(project, descriptor.identity(), &create_payload, &update_payload)
                    .await
            }

            async fn update(&self, project: &str, descriptor: &ResourceDescriptor) -> DriverResult<ProviderHandle> {
                let payload = $payload(descriptor, Mode::Update)?;
                self.core.update(project, descriptor.identity(), &payload).await
            }

            async fn delete(&self, project: &str, identity: &str) -> DriverResult<()> {
                self.core.delete(project, identity).await
            }
        }
    };
}

http_driver!(
    /// Driver for cloud projects.
    ProjectDriver,
    ResourceKind::Project,
    "settings",
    project_payload
);

http_driver!(
    /// Driver for project role bindings.
    IamBindingDriver,
    ResourceKind::IamBinding,
    "iam-bindings",
    iam_binding_payload
);

http_driver!(
    /// Driver for repository build triggers.
    BuildTriggerDriver,
    ResourceKind::BuildTrigger,
    "build-triggers",
    build_trigger_payload
);

http_driver!(
    /// Driver for managed database instances.
    DatabaseInstanceDriver,
    ResourceKind::DatabaseInstance,
    "database-instances",
    database_instance_payload
);

http_driver!(
    /// Driver for secret store entries.
    SecretDriver,
    ResourceKind::Secret,
    "secrets",
    secret_payload
);

http_driver!(
    /// Driver for pub/sub topics.
    TopicDriver,
    ResourceKind::Topic,
    "topics",
    topic_payload
);

http_driver!(
    /// Driver for serving deployments.
    ServiceDeploymentDriver,
    ResourceKind::ServiceDeployment,
    "services",
    service_deployment_payload
);

http_driver!(
    /// Driver for DNS records.
    DnsRecordDriver,
    ResourceKind::DnsRecord,
    "dns-records",
    dns_record_payload
);

// ============================================================================
// Payload translation
// ============================================================================

fn field<'a>(d: &'a ResourceDescriptor, key: &str) -> &'a Value {
    d.config().get(key).unwrap_or(&Value::Null)
}

fn require_str<'a>(d: &'a ResourceDescriptor, key: &str) -> DriverResult<&'a str> {
    d.get_str(key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DriverError::invalid_config(format!("{} '{}' is missing '{key}'", d.kind(), d.identity())))
}

/// Converts a JSON object into a payload, dropping null members.
fn object(value: Value) -> DesiredConfig {
    match value {
        Value::Object(map) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => DesiredConfig::new(),
    }
}

fn project_payload(d: &ResourceDescriptor, _mode: Mode) -> DriverResult<DesiredConfig> {
    Ok(object(json!({
        "project_id": d.identity(),
        "display_name": d.get_str("display_name").unwrap_or(d.identity()),
        "region": field(d, "region"),
        "labels": field(d, "labels"),
    })))
}

fn iam_binding_payload(d: &ResourceDescriptor, _mode: Mode) -> DriverResult<DesiredConfig> {
    let role = require_str(d, "role")?;
    let mut members: Vec<&str> = field(d, "members")
        .as_array()
        .map(|m| m.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if members.is_empty() {
        return Err(DriverError::invalid_config(format!(
            "iam binding '{}' has no members",
            d.identity()
        )));
    }
    members.sort_unstable();
    members.dedup();

    Ok(object(json!({ "role": role, "members": members })))
}

fn build_trigger_payload(d: &ResourceDescriptor, _mode: Mode) -> DriverResult<DesiredConfig> {
    let repository = require_str(d, "repository")?;
    let image = require_str(d, "image")?;
    let push = match (d.get_str("branch"), d.get_str("tag")) {
        (Some(branch), None) => json!({ "branch": format!("^{branch}$") }),
        (None, Some(tag)) => json!({ "tag": format!("^{tag}$") }),
        _ => {
            return Err(DriverError::invalid_config(format!(
                "build trigger '{}' must track exactly one of branch or tag",
                d.identity()
            )));
        }
    };

    Ok(object(json!({
        "name": d.identity(),
        "repository": repository,
        "push": push,
        "build": object_value(json!({
            "image": image,
            "buildpack": field(d, "buildpack"),
        })),
        "substitutions": field(d, "substitutions"),
    })))
}

fn database_instance_payload(d: &ResourceDescriptor, _mode: Mode) -> DriverResult<DesiredConfig> {
    let availability = if field(d, "high_availability").as_bool().unwrap_or(false) {
        "REGIONAL"
    } else {
        "ZONAL"
    };

    Ok(object(json!({
        "name": d.identity(),
        "database_version": require_str(d, "engine_version")?,
        "region": require_str(d, "region")?,
        "settings": {
            "tier": require_str(d, "tier")?,
            "availability_type": availability,
        },
        "database": field(d, "database"),
        "user": field(d, "user"),
    })))
}

/// Generated secrets are realized once, at creation; updates leave the value alone.
fn secret_payload(d: &ResourceDescriptor, mode: Mode) -> DriverResult<DesiredConfig> {
    let value = match (d.get_str("value"), field(d, "generate").as_u64()) {
        (Some(value), _) => Value::from(value),
        (None, Some(length)) if mode == Mode::Create => Value::from(generate_secret(length)),
        (None, Some(_)) => Value::Null,
        (None, None) => {
            return Err(DriverError::invalid_config(format!(
                "secret '{}' needs a value or a generate length",
                d.identity()
            )));
        }
    };

    Ok(object(json!({
        "secret_id": d.identity(),
        "replication": "automatic",
        "value": value,
    })))
}

fn topic_payload(d: &ResourceDescriptor, _mode: Mode) -> DriverResult<DesiredConfig> {
    Ok(object(json!({
        "name": d.identity(),
        "labels": field(d, "labels"),
        "message_retention_duration": field(d, "retention"),
    })))
}

fn service_deployment_payload(d: &ResourceDescriptor, _mode: Mode) -> DriverResult<DesiredConfig> {
    let image = require_str(d, "image")?;
    let region = require_str(d, "region")?;

    let mut env: Vec<Value> = field(d, "env")
        .as_object()
        .map(|vars| {
            vars.iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect()
        })
        .unwrap_or_default();
    if let Some(secrets) = field(d, "secrets").as_object() {
        env.extend(secrets.iter().map(|(name, secret)| {
            json!({ "name": name, "secret": { "name": secret, "version": "latest" } })
        }));
    }

    let cloud_sql: Vec<&str> = d.get_str("database").into_iter().collect();
    let timeout = field(d, "timeout_secs").as_u64().map(|s| format!("{s}s"));
    let invoker = if field(d, "authenticated").as_bool().unwrap_or(false) {
        "authenticated"
    } else {
        "allUsers"
    };

    Ok(object(json!({
        "name": d.identity(),
        "region": region,
        "template": object_value(json!({
            "containers": [{
                "image": image,
                "env": env,
                "resources": { "limits": object_value(json!({
                    "cpu": field(d, "cpu"),
                    "memory": field(d, "memory"),
                })) },
            }],
            "scaling": object_value(json!({
                "min_instance_count": field(d, "min_instances"),
                "max_instance_count": field(d, "max_instances"),
            })),
            "max_instance_request_concurrency": field(d, "concurrency"),
            "timeout": timeout,
            "cloud_sql_instances": cloud_sql,
        })),
        "ingress": "all",
        "invoker": invoker,
        "labels": field(d, "labels"),
    })))
}

fn dns_record_payload(d: &ResourceDescriptor, _mode: Mode) -> DriverResult<DesiredConfig> {
    let zone = require_str(d, "zone")?;
    let target = require_str(d, "target")?;

    Ok(object(json!({
        "zone": zone,
        "name": fqdn(d.identity()),
        "type": d.get_str("record_type").unwrap_or("CNAME"),
        "ttl": field(d, "ttl").as_u64().unwrap_or(300),
        "rrdatas": [fqdn(target)],
    })))
}

fn object_value(value: Value) -> Value {
    Value::Object(object(value).into_iter().collect())
}

fn fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

/// Alphanumeric secret of `length` characters drawn from the OS CSPRNG.
fn generate_secret(length: u64) -> String {
    let length = usize::try_from(length).unwrap_or(usize::MAX).clamp(8, 256);
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ProvisioningClient {
        ProvisioningClient::new(&server.uri(), None, Duration::from_secs(5)).expect("client")
    }

    fn topic() -> ResourceDescriptor {
        ResourceDescriptor::builder(ResourceKind::Topic, "events")
            .set("retention", "86400s")
            .build()
    }

    #[test]
    fn test_iam_members_are_sorted_and_deduplicated() {
        let d = ResourceDescriptor::builder(ResourceKind::IamBinding, "roles/run.admin")
            .set("role", "roles/run.admin")
            .set("members", json!(["user:b@x.io", "user:a@x.io", "user:b@x.io"]))
            .build();

        let payload = iam_binding_payload(&d, Mode::Create).expect("payload");
        assert_eq!(payload["members"], json!(["user:a@x.io", "user:b@x.io"]));
    }

    #[test]
    fn test_missing_required_key_is_invalid_config() {
        let d = ResourceDescriptor::builder(ResourceKind::ServiceDeployment, "api")
            .set("region", "europe-west1")
            .build();

        let err = service_deployment_payload(&d, Mode::Create).expect_err("image missing");
        assert!(matches!(err, DriverError::InvalidConfig { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_build_trigger_needs_one_ref() {
        let both = ResourceDescriptor::builder(ResourceKind::BuildTrigger, "api")
            .set("repository", "org/api")
            .set("image", "gcr.io/p1/api")
            .set("branch", "main")
            .set("tag", "v1")
            .build();
        assert!(build_trigger_payload(&both, Mode::Create).is_err());
    }

    #[test]
    fn test_generated_secret_only_on_create() {
        let d = ResourceDescriptor::builder(ResourceKind::Secret, "django-key")
            .set("generate", 50)
            .build();

        let created = secret_payload(&d, Mode::Create).expect("create payload");
        assert_eq!(created["value"].as_str().map(str::len), Some(50));

        let updated = secret_payload(&d, Mode::Update).expect("update payload");
        assert!(!updated.contains_key("value"));
    }

    #[test]
    fn test_generated_secrets_are_alphanumeric_and_distinct() {
        let first = generate_secret(64);
        let second = generate_secret(64);

        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(first.chars().any(|c| !c.is_ascii_hexdigit()) || second.chars().any(|c| !c.is_ascii_hexdigit()));
        assert_ne!(first, second);

        assert_eq!(generate_secret(2).len(), 8);
        assert_eq!(generate_secret(10_000).len(), 256);
    }

    #[test]
    fn test_dns_record_is_fully_qualified() {
        let d = ResourceDescriptor::builder(ResourceKind::DnsRecord, "api.example.com")
            .set("zone", "example-com")
            .set("target", "ghs.googlehosted.com")
            .build();

        let payload = dns_record_payload(&d, Mode::Create).expect("payload");
        assert_eq!(payload["name"], json!("api.example.com."));
        assert_eq!(payload["rrdatas"], json!(["ghs.googlehosted.com."]));
        assert_eq!(payload["type"], json!("CNAME"));
    }

    #[tokio::test]
    async fn test_create_adopts_identical_existing_resource() {
        let server = MockServer::start().await;
        let expected = topic_payload(&topic(), Mode::Update).expect("payload");

        Mock::given(method("POST"))
            .and(path("/projects/p1/topics"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/projects/p1/topics/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "topics/events",
                "attributes": expected,
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let handle = TopicDriver::new(client(&server))
            .create("p1", &topic())
            .await
            .expect("adopted");
        assert_eq!(handle.id, "topics/events");
    }

    #[tokio::test]
    async fn test_create_updates_differing_existing_resource() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/projects/p1/topics"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/projects/p1/topics/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "topics/events",
                "attributes": { "name": "events" },
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/projects/p1/topics/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "topics/events" })))
            .expect(1)
            .mount(&server)
            .await;

        let handle = TopicDriver::new(client(&server))
            .create("p1", &topic())
            .await
            .expect("updated in place");
        assert_eq!(handle.id, "topics/events");
    }

    #[tokio::test]
    async fn test_invalid_config_never_reaches_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let d = ResourceDescriptor::builder(ResourceKind::DnsRecord, "api.example.com").build();
        let err = DnsRecordDriver::new(client(&server))
            .create("p1", &d)
            .await
            .expect_err("zone and target missing");
        assert!(matches!(err, DriverError::InvalidConfig { .. }));
    }
}
