//! Shared fixtures for integration tests: scripted drivers and descriptors.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use provision_pilot::driver::{DriverRegistry, DriverResult, ProviderHandle, ResourceDriver};
use provision_pilot::error::DriverError;
use provision_pilot::resource::{ResourceDescriptor, ResourceKind};

/// One driver call as seen by a [`ScriptedDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: &'static str,
    pub kind: ResourceKind,
    pub identity: String,
}

impl std::fmt::Display for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.method, self.kind, self.identity)
    }
}

/// Call log shared by every driver of a registry, in invocation order.
pub type CallLog = Arc<Mutex<Vec<Call>>>;

/// Driver that succeeds unless told otherwise and records every call.
pub struct ScriptedDriver {
    kind: ResourceKind,
    log: CallLog,
    failures: Mutex<HashMap<String, VecDeque<DriverError>>>,
    delay: Option<Duration>,
}

impl ScriptedDriver {
    fn new(kind: ResourceKind, log: CallLog, delay: Option<Duration>) -> Self {
        Self {
            kind,
            log,
            failures: Mutex::new(HashMap::new()),
            delay,
        }
    }

    /// Queues `error` for the next mutating call on `identity`.
    pub fn fail_next(&self, identity: &str, error: DriverError) {
        self.failures
            .lock()
            .unwrap()
            .entry(identity.to_string())
            .or_default()
            .push_back(error);
    }

    async fn call(&self, method: &'static str, identity: &str) -> DriverResult<()> {
        self.log.lock().unwrap().push(Call {
            method,
            kind: self.kind,
            identity: identity.to_string(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .failures
            .lock()
            .unwrap()
            .get_mut(identity)
            .and_then(VecDeque::pop_front);
        next.map_or(Ok(()), Err)
    }

    fn handle(&self, identity: &str) -> ProviderHandle {
        ProviderHandle::new(format!("{}/{identity}", self.kind))
    }
}

#[async_trait]
impl ResourceDriver for ScriptedDriver {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn describe_current(&self, _project: &str, identity: &str) -> DriverResult<ProviderHandle> {
        self.call("describe", identity).await?;
        Ok(self.handle(identity))
    }

    async fn create(&self, _project: &str, descriptor: &ResourceDescriptor) -> DriverResult<ProviderHandle> {
        self.call("create", descriptor.identity()).await?;
        Ok(self.handle(descriptor.identity()))
    }

    async fn update(&self, _project: &str, descriptor: &ResourceDescriptor) -> DriverResult<ProviderHandle> {
        self.call("update", descriptor.identity()).await?;
        Ok(self.handle(descriptor.identity()))
    }

    async fn delete(&self, _project: &str, identity: &str) -> DriverResult<()> {
        self.call("delete", identity).await
    }
}

/// One scripted driver per kind sharing a call log.
pub struct Drivers {
    drivers: HashMap<ResourceKind, Arc<ScriptedDriver>>,
    log: CallLog,
}

impl Drivers {
    pub fn new() -> Self {
        Self::with_delay(None)
    }

    /// Drivers that pause on every call, to keep a run in flight.
    pub fn slow(delay: Duration) -> Self {
        Self::with_delay(Some(delay))
    }

    fn with_delay(delay: Option<Duration>) -> Self {
        let log = CallLog::default();
        let drivers = ResourceKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(ScriptedDriver::new(kind, Arc::clone(&log), delay))))
            .collect();
        Self { drivers, log }
    }

    pub fn get(&self, kind: ResourceKind) -> &ScriptedDriver {
        &self.drivers[&kind]
    }

    pub fn registry(&self) -> DriverRegistry {
        self.drivers
            .values()
            .fold(DriverRegistry::builder(), |builder, driver| {
                builder.register(Arc::clone(driver) as Arc<dyn ResourceDriver>)
            })
            .build()
            .unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    pub fn call_strings(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }
}

pub fn project(id: &str) -> ResourceDescriptor {
    ResourceDescriptor::builder(ResourceKind::Project, id)
        .set("region", "us-central1")
        .build()
}

pub fn binding(role: &str) -> ResourceDescriptor {
    ResourceDescriptor::builder(ResourceKind::IamBinding, role)
        .set("role", format!("roles/{role}"))
        .set("members", serde_json::json!(["serviceAccount:api@p1.iam.gserviceaccount.com"]))
        .build()
}

pub fn service(name: &str, image: &str) -> ResourceDescriptor {
    ResourceDescriptor::builder(ResourceKind::ServiceDeployment, name)
        .set("image", image)
        .set("region", "us-central1")
        .build()
}

pub fn secret(name: &str) -> ResourceDescriptor {
    ResourceDescriptor::builder(ResourceKind::Secret, name)
        .set("generate", 32)
        .build()
}

pub fn topic(name: &str) -> ResourceDescriptor {
    ResourceDescriptor::builder(ResourceKind::Topic, name)
        .set("labels", serde_json::json!({}))
        .build()
}

pub fn dns(name: &str) -> ResourceDescriptor {
    ResourceDescriptor::builder(ResourceKind::DnsRecord, name)
        .set("zone", "example-com")
        .set("target", "ghs.googlehosted.com")
        .build()
}
