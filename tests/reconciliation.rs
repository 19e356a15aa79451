//! End-to-end reconciliation scenarios against the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Drivers, binding, dns, project, secret, service, topic};
use provision_pilot::error::{DriverError, PilotError, ReconcileError};
use provision_pilot::planner::Action;
use provision_pilot::reconciler::{ManualClock, Outcome, Reconciler, RunStatus, SkipReason};
use provision_pilot::resource::{RemovalMarker, ResourceDescriptor, ResourceKey, ResourceKind};
use provision_pilot::state::{MemoryStateStore, RecordStatus, StateStore};

fn reconciler(store: &Arc<MemoryStateStore>, drivers: &Drivers) -> Reconciler {
    Reconciler::new(Arc::clone(store) as Arc<dyn StateStore>, drivers.registry())
        .with_clock(Arc::new(ManualClock::default()))
}

fn scenario() -> Vec<ResourceDescriptor> {
    vec![project("p1"), binding("owner"), service("api", "v1")]
}

#[tokio::test]
async fn fresh_project_creates_everything_in_dependency_order() {
    let store = Arc::new(MemoryStateStore::new());
    let drivers = Drivers::new();
    let reconciler = reconciler(&store, &drivers);

    let plan = reconciler.plan("p1", &scenario(), &[]).await.unwrap();
    let actions: Vec<(Action, ResourceKey)> = plan.operations().iter().map(|op| (op.action, op.key().clone())).collect();
    assert_eq!(
        actions,
        vec![
            (Action::Create, ResourceKey::new(ResourceKind::Project, "p1")),
            (Action::Create, ResourceKey::new(ResourceKind::IamBinding, "owner")),
            (Action::Create, ResourceKey::new(ResourceKind::ServiceDeployment, "api")),
        ]
    );

    let run = reconciler.apply(&plan).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(
        drivers.call_strings(),
        vec!["create project/p1", "create iam_binding/owner", "create service_deployment/api"]
    );

    let records = store.list("p1").await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == RecordStatus::Applied));
}

#[tokio::test]
async fn quota_exceeded_on_service_is_partial_failure() {
    let store = Arc::new(MemoryStateStore::new());
    let drivers = Drivers::new();
    drivers.get(ResourceKind::ServiceDeployment).fail_next(
        "api",
        DriverError::QuotaExceeded {
            message: String::from("cpu quota"),
        },
    );

    let run = reconciler(&store, &drivers)
        .reconcile("p1", &scenario(), &[])
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::PartiallyFailed);
    let service_key = ResourceKey::new(ResourceKind::ServiceDeployment, "api");
    assert!(matches!(
        run.entry(&service_key).map(|e| &e.outcome),
        Some(Outcome::Failed { attempts: 1, .. })
    ));

    let record = store.get("p1", &service_key).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.checksum, None);

    let project_record = store
        .get("p1", &ResourceKey::new(ResourceKind::Project, "p1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(project_record.status, RecordStatus::Applied);
}

#[tokio::test]
async fn image_change_plans_a_single_update() {
    let store = Arc::new(MemoryStateStore::new());
    let drivers = Drivers::new();
    let reconciler = reconciler(&store, &drivers);

    reconciler.reconcile("p1", &scenario(), &[]).await.unwrap();
    drivers.clear();

    let desired = vec![project("p1"), binding("owner"), service("api", "v2")];
    let plan = reconciler.plan("p1", &desired, &[]).await.unwrap();

    assert_eq!(plan.len(), 1);
    assert_eq!(plan.operations()[0].action, Action::Update);
    assert_eq!(plan.operations()[0].key(), &ResourceKey::new(ResourceKind::ServiceDeployment, "api"));
    assert_eq!(plan.unchanged().len(), 2);

    let run = reconciler.apply(&plan).await.unwrap();
    assert!(run.is_success());
    assert_eq!(drivers.call_strings(), vec!["update service_deployment/api"]);
}

#[tokio::test]
async fn rerun_of_applied_state_makes_no_driver_calls() {
    let store = Arc::new(MemoryStateStore::new());
    let drivers = Drivers::new();
    let reconciler = reconciler(&store, &drivers);

    reconciler.reconcile("p1", &scenario(), &[]).await.unwrap();
    drivers.clear();

    let run = reconciler.reconcile("p1", &scenario(), &[]).await.unwrap();

    assert!(drivers.calls().is_empty());
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.count("unchanged"), 3);
}

#[tokio::test]
async fn permanent_failure_skips_dependents_but_not_independent_work() {
    let store = Arc::new(MemoryStateStore::new());
    let drivers = Drivers::new();
    drivers.get(ResourceKind::Secret).fail_next(
        "db-password",
        DriverError::InvalidConfig {
            message: String::from("bad replication policy"),
        },
    );

    let desired = vec![
        project("p1"),
        binding("owner"),
        secret("db-password"),
        topic("orders"),
        service("api", "v1"),
        dns("shop.example.com"),
    ];
    let run = reconciler(&store, &drivers)
        .reconcile("p1", &desired, &[])
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::PartiallyFailed);

    let secret_key = ResourceKey::new(ResourceKind::Secret, "db-password");
    let outcome = |kind, identity: &str| {
        run.entry(&ResourceKey::new(kind, identity))
            .map(|e| e.outcome.clone())
            .unwrap()
    };

    assert_eq!(outcome(ResourceKind::Secret, "db-password").label(), "failed");
    assert_eq!(outcome(ResourceKind::Topic, "orders").label(), "applied");
    assert_eq!(
        outcome(ResourceKind::ServiceDeployment, "api"),
        Outcome::Skipped {
            reason: SkipReason::DependencyFailed { upstream: secret_key },
        }
    );
    assert_eq!(outcome(ResourceKind::DnsRecord, "shop.example.com").label(), "skipped");

    let attempted: Vec<String> = drivers.call_strings();
    assert!(attempted.contains(&String::from("create topic/orders")));
    assert!(!attempted.iter().any(|c| c.contains("service_deployment") || c.contains("dns_record")));

    let resumed = drivers.calls().len();
    let rerun = reconciler(&store, &drivers)
        .reconcile("p1", &desired, &[])
        .await
        .unwrap();
    assert_eq!(rerun.status, RunStatus::Succeeded);
    let retried: Vec<String> = drivers.call_strings().split_off(resumed);
    assert_eq!(
        retried,
        vec![
            "create secret/db-password",
            "create service_deployment/api",
            "create dns_record/shop.example.com"
        ]
    );
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff() {
    let store = Arc::new(MemoryStateStore::new());
    let drivers = Drivers::new();
    let clock = Arc::new(ManualClock::default());
    for _ in 0..2 {
        drivers.get(ResourceKind::ServiceDeployment).fail_next(
            "api",
            DriverError::Unavailable {
                status: 503,
                message: String::from("try later"),
            },
        );
    }

    let run = Reconciler::new(Arc::clone(&store) as Arc<dyn StateStore>, drivers.registry())
        .with_clock(Arc::clone(&clock) as Arc<dyn provision_pilot::reconciler::Clock>)
        .reconcile("p1", &scenario(), &[])
        .await
        .unwrap();

    assert!(run.is_success());
    assert!(matches!(
        run.entry(&ResourceKey::new(ResourceKind::ServiceDeployment, "api")).map(|e| &e.outcome),
        Some(Outcome::Applied { attempts: 3, .. })
    ));
    assert_eq!(clock.sleeps().len(), 2);
    assert!(clock.sleeps()[1] > clock.sleeps()[0]);
}

#[tokio::test]
async fn removal_deletes_and_forgets_the_record() {
    let store = Arc::new(MemoryStateStore::new());
    let drivers = Drivers::new();
    let reconciler = reconciler(&store, &drivers);

    let mut desired = scenario();
    desired.push(topic("orders"));
    reconciler.reconcile("p1", &desired, &[]).await.unwrap();
    drivers.clear();

    let removals = [RemovalMarker::new(ResourceKind::Topic, "orders")];
    let run = reconciler.reconcile("p1", &scenario(), &removals).await.unwrap();

    assert!(run.is_success());
    assert_eq!(drivers.call_strings(), vec!["delete topic/orders"]);
    assert!(
        store
            .get("p1", &ResourceKey::new(ResourceKind::Topic, "orders"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn history_keeps_every_sealed_run() {
    let store = Arc::new(MemoryStateStore::new());
    let drivers = Drivers::new();
    let reconciler = reconciler(&store, &drivers);

    let first = reconciler.reconcile("p1", &scenario(), &[]).await.unwrap();
    let second = reconciler.reconcile("p1", &scenario(), &[]).await.unwrap();

    let runs = store.recent_runs("p1", 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].plan_id, second.plan_id);
    assert_eq!(runs[1].plan_id, first.plan_id);
}

#[tokio::test]
async fn concurrent_runs_for_one_project_get_exactly_one_lease() {
    let store = Arc::new(MemoryStateStore::new());
    let drivers = Drivers::slow(Duration::from_millis(20));

    let first = Reconciler::new(Arc::clone(&store) as Arc<dyn StateStore>, drivers.registry()).with_holder("runner-a");
    let second = Reconciler::new(Arc::clone(&store) as Arc<dyn StateStore>, drivers.registry()).with_holder("runner-b");

    let desired = scenario();
    let (a, b) = tokio::join!(
        first.reconcile("p1", &desired, &[]),
        second.reconcile("p1", &desired, &[])
    );

    let results = [a, b];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(PilotError::Reconcile(ReconcileError::ConcurrentReconciliationInProgress { .. }))
            )
        })
        .count();

    assert_eq!(succeeded, 1);
    assert_eq!(rejected, 1);
    assert!(results.iter().any(|r| r.as_ref().is_err_and(PilotError::is_retryable)));

    // Only the winner touched records.
    let records = store.list("p1").await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.generation == 1));
    assert_eq!(drivers.calls().len(), 3);
}

#[tokio::test]
async fn different_projects_reconcile_concurrently() {
    let store = Arc::new(MemoryStateStore::new());
    let drivers = Drivers::slow(Duration::from_millis(5));
    let reconciler = Reconciler::new(Arc::clone(&store) as Arc<dyn StateStore>, drivers.registry());

    let p1 = vec![project("p1"), binding("owner")];
    let p2 = vec![project("p2"), binding("owner")];
    let (a, b) = tokio::join!(reconciler.reconcile("p1", &p1, &[]), reconciler.reconcile("p2", &p2, &[]));

    assert!(a.unwrap().is_success());
    assert!(b.unwrap().is_success());
}
