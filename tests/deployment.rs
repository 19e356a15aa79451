//! Deployment trigger scenarios over the HTTP drivers, against a mock gateway.

use std::sync::Arc;
use std::time::Duration;

use provision_pilot::config::{ConfigParser, ConfigValidator, PilotConfig};
use provision_pilot::driver::{DriverRegistry, ProvisioningClient};
use provision_pilot::planner::Action;
use provision_pilot::reconciler::{ManualClock, Reconciler, RetryPolicy, RunStatus};
use provision_pilot::resource::{ResourceKey, ResourceKind};
use provision_pilot::state::{LocalStateStore, MemoryStateStore, RecordStatus, StateStore};
use provision_pilot::trigger::DeploymentTrigger;
use serde_json::json;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CONFIG: &str = r"
projects:
  - id: shop
    region: europe-west1
    app:
      name: api
      repository: org/shop-api
      build:
        branch: main
    secrets:
      - name: django-key
        generate: { length: 50 }
        expose_as: SECRET_KEY
    topics:
      - name: orders
    domains:
      - name: shop.example.com
        zone: example-com
";

fn config() -> PilotConfig {
    let config = ConfigParser::new().parse_yaml(CONFIG, None).unwrap();
    ConfigValidator::new().validate(&config).unwrap();
    config
}

fn trigger(server: &MockServer, store: Arc<dyn StateStore>) -> DeploymentTrigger {
    let client = ProvisioningClient::new(&server.uri(), Some(String::from("t0ken")), Duration::from_secs(5)).unwrap();
    let reconciler = Reconciler::new(store, DriverRegistry::http(&client))
        .with_clock(Arc::new(ManualClock::default()))
        .with_retry(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        });
    DeploymentTrigger::new(config(), reconciler).with_env_lookup(|_| None)
}

async fn accept_everything(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path_regex(r"^/projects/shop/[a-z-]+$"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "created" })))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/projects/shop/[a-z-]+/[a-z0-9.-]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "updated" })))
        .mount(server)
        .await;
}

async fn requests(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|r| format!("{} {}", r.method, r.url.path()))
        .collect()
}

#[tokio::test]
async fn deploy_creates_the_whole_project_over_http() {
    let server = MockServer::start().await;
    accept_everything(&server).await;

    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let summary = trigger(&server, Arc::clone(&store))
        .reconcile("shop", "refs/heads/main", "c0ffee")
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.commit_sha, "c0ffee");
    assert!(summary.operations.iter().all(|op| op.action == Action::Create));

    let sent = requests(&server).await;
    assert_eq!(sent.first().map(String::as_str), Some("POST /projects/shop/settings"));
    assert_eq!(sent.last().map(String::as_str), Some("POST /projects/shop/dns-records"));
    assert_eq!(sent.len(), summary.operations.len());

    let records = store.list("shop").await.unwrap();
    assert_eq!(records.len(), summary.operations.len());
    assert!(records.iter().all(|r| r.status == RecordStatus::Applied));
}

#[tokio::test]
async fn new_commit_only_rolls_the_service() {
    let server = MockServer::start().await;
    accept_everything(&server).await;

    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let trigger = trigger(&server, store);

    trigger.reconcile("shop", "main", "aaa111").await.unwrap();
    server.reset().await;
    accept_everything(&server).await;

    let summary = trigger.reconcile("shop", "main", "bbb222").await.unwrap();

    assert_eq!(summary.status, RunStatus::Succeeded);
    let updated: Vec<(ResourceKind, Action)> = summary
        .operations
        .iter()
        .filter(|op| op.outcome.label() == "applied")
        .map(|op| (op.kind, op.action))
        .collect();
    assert_eq!(updated, vec![(ResourceKind::ServiceDeployment, Action::Update)]);
    assert_eq!(requests(&server).await, vec!["PUT /projects/shop/services/api"]);
}

#[tokio::test]
async fn quota_exceeded_is_reported_per_resource() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/projects/shop/services"))
        .respond_with(ResponseTemplate::new(403).set_body_string("Quota 'CPUS' exceeded"))
        .with_priority(1)
        .mount(&server)
        .await;
    accept_everything(&server).await;

    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let summary = trigger(&server, Arc::clone(&store))
        .reconcile("shop", "main", "c0ffee")
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::PartiallyFailed);

    let outcome = |kind| {
        summary
            .operations
            .iter()
            .find(|op| op.kind == kind)
            .map(|op| op.outcome.label())
    };
    assert_eq!(outcome(ResourceKind::Project), Some("applied"));
    assert_eq!(outcome(ResourceKind::Topic), Some("applied"));
    assert_eq!(outcome(ResourceKind::ServiceDeployment), Some("failed"));
    assert_eq!(outcome(ResourceKind::DnsRecord), Some("skipped"));

    // Permanent failures are not retried.
    let service_posts = requests(&server)
        .await
        .into_iter()
        .filter(|r| r == "POST /projects/shop/services")
        .count();
    assert_eq!(service_posts, 1);

    let record = store
        .get("shop", &ResourceKey::new(ResourceKind::ServiceDeployment, "api"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RecordStatus::Failed);

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["status"], "partially_failed");
}

#[tokio::test]
async fn untracked_ref_never_reaches_the_gateway() {
    let server = MockServer::start().await;
    accept_everything(&server).await;

    let summary = trigger(&server, Arc::new(MemoryStateStore::new()))
        .reconcile("shop", "refs/heads/feature", "c0ffee")
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Rejected);
    assert!(requests(&server).await.is_empty());
}

#[tokio::test]
async fn local_state_survives_a_new_process() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    accept_everything(&server).await;

    let first = trigger(&server, Arc::new(LocalStateStore::with_base_dir(dir.path())));
    assert!(first.reconcile("shop", "main", "aaa111").await.unwrap().status == RunStatus::Succeeded);
    server.reset().await;
    accept_everything(&server).await;

    // A fresh store over the same directory sees everything as applied.
    let second = trigger(&server, Arc::new(LocalStateStore::with_base_dir(dir.path())));
    let summary = second.reconcile("shop", "main", "aaa111").await.unwrap();

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert!(summary.operations.iter().all(|op| op.outcome.label() == "unchanged"));
    assert!(requests(&server).await.is_empty());

    let history = second.reconciler().store().recent_runs("shop", 5).await.unwrap();
    assert_eq!(history.len(), 2);
}
