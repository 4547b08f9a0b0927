//! Shared fixtures for the controller tests

#![allow(dead_code)]

use async_trait::async_trait;
use ism_operator::controller::ControllerContext;
use ism_operator::crd::{
    Broker, BrokerSpec, ServiceBinding, ServiceBindingSpec, ServiceInstance, ServiceInstanceSpec,
};
use ism_operator::osb::{
    BindRequest, BindResponse, BrokerClient, BrokerClientFactory, BrokerConfig, Catalog,
    CatalogPlan, CatalogService, DeprovisionRequest, OsbError, OsbResult, ProvisionRequest,
    UnbindRequest,
};
use ism_operator::runtime::ReconcileContext;
use ism_operator::store::{MemoryStore, ObjectKey, ObjectStore};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "team-a";

/// A call received by the fake broker
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    Catalog,
    Provision(ProvisionRequest),
    Deprovision(DeprovisionRequest),
    Bind(BindRequest),
    Unbind(UnbindRequest),
}

#[derive(Default)]
struct FakeBrokerState {
    catalog: Catalog,
    credentials: serde_json::Map<String, serde_json::Value>,
    calls: Vec<BrokerCall>,
    configs: Vec<String>,
    catalog_errors: VecDeque<OsbError>,
    provision_errors: VecDeque<OsbError>,
    deprovision_errors: VecDeque<OsbError>,
    bind_errors: VecDeque<OsbError>,
    unbind_errors: VecDeque<OsbError>,
}

/// Recording broker with scripted failures.
///
/// Each `fail_*` call queues one error; queued errors are returned before the
/// broker starts answering successfully.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<FakeBrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        let broker = Self::default();
        broker.set_catalog(scenario_catalog());
        broker.set_credentials(serde_json::json!({"username": "u", "password": "pw"}));
        broker
    }

    pub fn set_catalog(&self, catalog: Catalog) {
        self.state.lock().catalog = catalog;
    }

    pub fn set_credentials(&self, credentials: serde_json::Value) {
        if let serde_json::Value::Object(map) = credentials {
            self.state.lock().credentials = map;
        }
    }

    pub fn fail_catalog(&self, error: OsbError) {
        self.state.lock().catalog_errors.push_back(error);
    }

    pub fn fail_provision(&self, error: OsbError) {
        self.state.lock().provision_errors.push_back(error);
    }

    pub fn fail_deprovision(&self, error: OsbError) {
        self.state.lock().deprovision_errors.push_back(error);
    }

    pub fn fail_bind(&self, error: OsbError) {
        self.state.lock().bind_errors.push_back(error);
    }

    pub fn fail_unbind(&self, error: OsbError) {
        self.state.lock().unbind_errors.push_back(error);
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.state.lock().calls.clone()
    }

    pub fn catalog_calls(&self) -> usize {
        self.count(|c| matches!(c, BrokerCall::Catalog))
    }

    pub fn provisions(&self) -> Vec<ProvisionRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::Provision(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn deprovisions(&self) -> Vec<DeprovisionRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::Deprovision(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn binds(&self) -> Vec<BindRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::Bind(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn unbinds(&self) -> Vec<UnbindRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::Unbind(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// Broker names clients were built for
    pub fn configs(&self) -> Vec<String> {
        self.state.lock().configs.clone()
    }

    fn count(&self, predicate: impl Fn(&BrokerCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Factory handing out clients backed by this broker
    pub fn factory(&self) -> Arc<dyn BrokerClientFactory> {
        Arc::new(FakeBrokerFactory {
            broker: self.clone(),
        })
    }
}

struct FakeBrokerFactory {
    broker: FakeBroker,
}

impl BrokerClientFactory for FakeBrokerFactory {
    fn client(&self, config: BrokerConfig) -> OsbResult<Box<dyn BrokerClient>> {
        self.broker.state.lock().configs.push(config.name.clone());
        Ok(Box::new(self.broker.clone()))
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn catalog(&self) -> OsbResult<Catalog> {
        let mut state = self.state.lock();
        state.calls.push(BrokerCall::Catalog);
        match state.catalog_errors.pop_front() {
            Some(error) => Err(error),
            None => Ok(state.catalog.clone()),
        }
    }

    async fn provision(&self, request: &ProvisionRequest) -> OsbResult<()> {
        let mut state = self.state.lock();
        state.calls.push(BrokerCall::Provision(request.clone()));
        match state.provision_errors.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn deprovision(&self, request: &DeprovisionRequest) -> OsbResult<()> {
        let mut state = self.state.lock();
        state.calls.push(BrokerCall::Deprovision(request.clone()));
        match state.deprovision_errors.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn bind(&self, request: &BindRequest) -> OsbResult<BindResponse> {
        let mut state = self.state.lock();
        state.calls.push(BrokerCall::Bind(request.clone()));
        match state.bind_errors.pop_front() {
            Some(error) => Err(error),
            None => Ok(BindResponse {
                credentials: state.credentials.clone(),
            }),
        }
    }

    async fn unbind(&self, request: &UnbindRequest) -> OsbResult<()> {
        let mut state = self.state.lock();
        state.calls.push(BrokerCall::Unbind(request.clone()));
        match state.unbind_errors.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

pub fn status_error(code: u16, description: &str) -> OsbError {
    OsbError::Status {
        code,
        description: description.to_string(),
    }
}

// ==================== Fixtures ====================

/// One service `s1` with plans `p1` (small) and `p2` (big)
pub fn scenario_catalog() -> Catalog {
    Catalog {
        services: vec![CatalogService {
            id: "s1".to_string(),
            name: "svc".to_string(),
            description: "test service".to_string(),
            bindable: true,
            plans: vec![plan("p1", "small"), plan("p2", "big")],
        }],
    }
}

pub fn plan(id: &str, name: &str) -> CatalogPlan {
    CatalogPlan {
        id: id.to_string(),
        name: name.to_string(),
        description: String::new(),
        free: None,
    }
}

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        ..Default::default()
    }
}

pub fn broker(name: &str) -> Broker {
    Broker {
        metadata: meta(name),
        spec: BrokerSpec {
            name: name.to_string(),
            url: "http://x".to_string(),
            username: "a".to_string(),
            password: "b".to_string(),
        },
        status: None,
    }
}

pub fn instance(name: &str, broker_name: &str) -> ServiceInstance {
    ServiceInstance {
        metadata: meta(name),
        spec: ServiceInstanceSpec {
            name: name.to_string(),
            plan_id: "p1".to_string(),
            service_id: "s1".to_string(),
            broker_name: broker_name.to_string(),
        },
        status: None,
    }
}

pub fn binding(name: &str, instance_id: &str, broker_name: &str) -> ServiceBinding {
    ServiceBinding {
        metadata: meta(name),
        spec: ServiceBindingSpec {
            name: name.to_string(),
            instance_id: instance_id.to_string(),
            plan_id: "p1".to_string(),
            service_id: "s1".to_string(),
            broker_name: broker_name.to_string(),
        },
        status: None,
    }
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

// ==================== Harness ====================

/// In-memory store plus fake broker, for driving reconcilers directly
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub broker: FakeBroker,
    shutdown: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            broker: FakeBroker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> ControllerContext<MemoryStore> {
        ControllerContext::new(self.store.clone(), self.broker.factory())
    }

    pub fn reconcile_context(&self) -> ReconcileContext {
        ReconcileContext::new(self.shutdown.clone())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn get<K: ism_operator::store::StoredObject>(&self, name: &str) -> Option<K> {
        self.store.get::<K>(NAMESPACE, name).await.unwrap()
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
