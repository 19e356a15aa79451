//! HTTP client for the provisioning gateway.
//!
//! The gateway exposes one collection per resource kind under a project:
//! `GET/PUT/DELETE {base}/projects/{project}/{collection}/{identity}` and
//! `POST {base}/projects/{project}/{collection}`.

use reqwest::{Client, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::DriverError;
use crate::resource::{DesiredConfig, ResourceKind};

use super::{DriverResult, ProviderHandle};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Retry delay used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Which call produced a response; 409 means something different for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Describe,
    Create,
    Update,
    Delete,
}

/// Resource document exchanged with the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResourceDocument {
    id: String,
    #[serde(default)]
    attributes: DesiredConfig,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    identity: &'a str,
    attributes: &'a DesiredConfig,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    attributes: &'a DesiredConfig,
}

/// Provisioning gateway client.
#[derive(Debug, Clone)]
pub struct ProvisioningClient {
    /// HTTP client.
    client: Client,
    /// Gateway base URL without trailing slash.
    base_url: String,
    /// Bearer token.
    token: Option<String>,
}

impl ProvisioningClient {
    /// Creates a new gateway client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> DriverResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DriverError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Returns the gateway base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, project: &str, collection: &str) -> String {
        format!("{}/projects/{project}/{collection}", self.base_url)
    }

    fn resource_url(&self, project: &str, collection: &str, identity: &str) -> String {
        format!("{}/{identity}", self.collection_url(project, collection))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    /// Reads the current provider-side state of a resource.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource does not exist.
    pub async fn describe(
        &self,
        project: &str,
        kind: ResourceKind,
        collection: &str,
        identity: &str,
    ) -> DriverResult<ProviderHandle> {
        let url = self.resource_url(project, collection, identity);
        trace!("GET {url}");

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(transport_error)?;

        let document: ResourceDocument = Self::parse(response, Call::Describe, kind, identity).await?;
        Ok(document.into())
    }

    /// Creates a resource.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` when the gateway reports a conflict.
    pub async fn create(
        &self,
        project: &str,
        kind: ResourceKind,
        collection: &str,
        identity: &str,
        attributes: &DesiredConfig,
    ) -> DriverResult<ProviderHandle> {
        let url = self.collection_url(project, collection);
        debug!("POST {url} ({kind} '{identity}')");

        let response = self
            .authorize(self.client.post(&url))
            .json(&CreateRequest { identity, attributes })
            .send()
            .await
            .map_err(transport_error)?;

        let document: ResourceDocument = Self::parse(response, Call::Create, kind, identity).await?;
        Ok(document.into())
    }

    /// Replaces the attributes of an existing resource.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource does not exist.
    pub async fn update(
        &self,
        project: &str,
        kind: ResourceKind,
        collection: &str,
        identity: &str,
        attributes: &DesiredConfig,
    ) -> DriverResult<ProviderHandle> {
        let url = self.resource_url(project, collection, identity);
        debug!("PUT {url}");

        let response = self
            .authorize(self.client.put(&url))
            .json(&UpdateRequest { attributes })
            .send()
            .await
            .map_err(transport_error)?;

        let document: ResourceDocument = Self::parse(response, Call::Update, kind, identity).await?;
        Ok(document.into())
    }

    /// Deletes a resource.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource does not exist, `DependentResourceExists`
    /// on a conflict.
    pub async fn delete(&self, project: &str, kind: ResourceKind, collection: &str, identity: &str) -> DriverResult<()> {
        let url = self.resource_url(project, collection, identity);
        debug!("DELETE {url}");

        let response = self
            .authorize(self.client.delete(&url))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Self::error_for(response, Call::Delete, kind, identity).await)
    }

    async fn parse<T: for<'de> Deserialize<'de>>(
        response: Response,
        call: Call,
        kind: ResourceKind,
        identity: &str,
    ) -> DriverResult<T> {
        if !response.status().is_success() {
            return Err(Self::error_for(response, call, kind, identity).await);
        }

        response.json::<T>().await.map_err(|e| DriverError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })
    }

    async fn error_for(response: Response, call: Call, kind: ResourceKind, identity: &str) -> DriverError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        classify_status(status, retry_after, &body, call, kind, identity)
    }
}

impl From<ResourceDocument> for ProviderHandle {
    fn from(document: ResourceDocument) -> Self {
        Self {
            id: document.id,
            attributes: document.attributes,
        }
    }
}

fn transport_error(e: reqwest::Error) -> DriverError {
    if e.is_timeout() {
        DriverError::Timeout {
            message: e.to_string(),
        }
    } else {
        DriverError::network(format!("Request failed: {e}"))
    }
}

/// Maps a non-success gateway status to a classified driver error.
fn classify_status(
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
    call: Call,
    kind: ResourceKind,
    identity: &str,
) -> DriverError {
    let identity = identity.to_string();
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("no message").to_string()
    } else {
        body.to_string()
    };

    match status.as_u16() {
        404 => DriverError::NotFound { kind, identity },
        409 => match call {
            Call::Create => DriverError::AlreadyExists { kind, identity },
            Call::Delete => DriverError::DependentResourceExists { kind, identity },
            Call::Update | Call::Describe => DriverError::Conflict { message },
        },
        429 => DriverError::RateLimited {
            retry_after_secs: retry_after.filter(|s| *s > 0).unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        403 if message.to_lowercase().contains("quota") => DriverError::QuotaExceeded { message },
        400 | 422 => DriverError::InvalidConfig { message },
        401 | 403 => DriverError::PermissionDenied { message },
        408 | 504 => DriverError::Timeout { message },
        code if status.is_server_error() => DriverError::Unavailable { status: code, message },
        code => DriverError::InvalidResponse {
            message: format!("Unexpected status {code}: {message}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ProvisioningClient {
        ProvisioningClient::new(&server.uri(), Some(String::from("t0ken")), Duration::from_secs(5))
            .expect("client")
    }

    fn attrs() -> DesiredConfig {
        let mut config = DesiredConfig::new();
        config.insert("name".into(), json!("events"));
        config
    }

    #[test]
    fn test_status_classification() {
        let kind = ResourceKind::Topic;
        let classify = |code: u16, call, body: &str| {
            classify_status(
                StatusCode::from_u16(code).expect("status"),
                Some(3),
                body,
                call,
                kind,
                "events",
            )
        };

        assert!(matches!(classify(404, Call::Update, ""), DriverError::NotFound { .. }));
        assert!(matches!(classify(409, Call::Create, ""), DriverError::AlreadyExists { .. }));
        assert!(matches!(classify(409, Call::Delete, ""), DriverError::DependentResourceExists { .. }));
        assert!(matches!(classify(409, Call::Update, ""), DriverError::Conflict { .. }));
        assert_eq!(classify(429, Call::Create, ""), DriverError::RateLimited { retry_after_secs: 3 });
        assert!(matches!(classify(403, Call::Create, "Quota 'CPUS' exceeded"), DriverError::QuotaExceeded { .. }));
        assert!(matches!(classify(403, Call::Create, "caller lacks role"), DriverError::PermissionDenied { .. }));
        assert!(matches!(classify(422, Call::Create, ""), DriverError::InvalidConfig { .. }));
        assert!(matches!(classify(504, Call::Create, ""), DriverError::Timeout { .. }));
        assert!(matches!(classify(502, Call::Create, ""), DriverError::Unavailable { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_create_posts_identity_and_attributes() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/projects/p1/topics"))
            .and(header_eq("authorization", "Bearer t0ken"))
            .and(body_json(json!({ "identity": "events", "attributes": { "name": "events" } })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "topics/events",
                "attributes": { "name": "events" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let handle = client(&server)
            .create("p1", ResourceKind::Topic, "topics", "events", &attrs())
            .await
            .expect("create");

        assert_eq!(handle.id, "topics/events");
        assert_eq!(handle.attributes, attrs());
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_after() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/projects/p1/topics/events"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let err = client(&server)
            .update("p1", ResourceKind::Topic, "topics", "events", &attrs())
            .await
            .expect_err("should be rate limited");

        assert_eq!(err, DriverError::RateLimited { retry_after_secs: 7 });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_describe_missing() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/projects/p1/topics/events"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .describe("p1", ResourceKind::Topic, "topics", "events")
            .await
            .expect_err("missing");

        assert!(matches!(err, DriverError::NotFound { kind: ResourceKind::Topic, .. }));
    }

    #[tokio::test]
    async fn test_delete_conflict_means_dependents() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/projects/p1/topics/events"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let err = client(&server)
            .delete("p1", ResourceKind::Topic, "topics", "events")
            .await
            .expect_err("conflict");

        assert!(matches!(err, DriverError::DependentResourceExists { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transient() {
        let client = ProvisioningClient::new("http://127.0.0.1:9", None, Duration::from_millis(500))
            .expect("client");

        let err = client
            .describe("p1", ResourceKind::Topic, "topics", "events")
            .await
            .expect_err("no gateway");

        assert!(err.is_transient());
    }
}
