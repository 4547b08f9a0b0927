//! Open Service Broker client
//!
//! The capability set the controllers need from a broker is defined once in
//! [`BrokerClient`]. [`HttpBrokerClient`] implements it over HTTP; tests plug
//! in recording fakes through [`BrokerClientFactory`].
//!
//! All operations are synchronous from the broker's point of view: every
//! request is sent with `accepts_incomplete=false`.

mod error;
mod http;

pub use error::{OsbError, OsbResult};
pub use http::{HttpBrokerClient, HttpClientFactory, OSB_API_VERSION};

use crate::crd::Broker;
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default timeout for broker requests
pub const DEFAULT_BROKER_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for one broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker name (for logging)
    pub name: String,
    /// Base URL of the broker
    pub url: String,
    /// Basic auth username
    pub username: String,
    /// Basic auth password
    pub password: SecretString,
    /// Per-request timeout
    pub timeout: Duration,
}

impl BrokerConfig {
    /// Connection settings taken from a Broker record's spec
    pub fn from_broker(broker: &Broker, timeout: Duration) -> Self {
        Self {
            name: broker.spec.name.clone(),
            url: broker.spec.url.clone(),
            username: broker.spec.username.clone(),
            password: SecretString::from(broker.spec.password.clone()),
            timeout,
        }
    }
}

/// Catalog returned by `GET /v2/catalog`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub services: Vec<CatalogService>,
}

/// A service offering in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogService {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plans: Vec<CatalogPlan>,
}

/// A plan of a service offering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogPlan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub free: Option<bool>,
}

/// Provision a service instance
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
}

/// Deprovision a service instance
#[derive(Debug, Clone, PartialEq)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
}

/// Create a binding for a service instance
#[derive(Debug, Clone, PartialEq)]
pub struct BindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
}

/// Result of a successful bind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindResponse {
    #[serde(default)]
    pub credentials: serde_json::Map<String, serde_json::Value>,
}

/// Delete a binding
#[derive(Debug, Clone, PartialEq)]
pub struct UnbindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
}

/// Operations the controllers perform against a service broker
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Fetch the broker's catalog of services and plans
    async fn catalog(&self) -> OsbResult<Catalog>;

    /// Provision an instance. Repeating a request with the same id is idempotent.
    async fn provision(&self, request: &ProvisionRequest) -> OsbResult<()>;

    /// Deprovision an instance
    async fn deprovision(&self, request: &DeprovisionRequest) -> OsbResult<()>;

    /// Create a binding and return its credentials
    async fn bind(&self, request: &BindRequest) -> OsbResult<BindResponse>;

    /// Delete a binding
    async fn unbind(&self, request: &UnbindRequest) -> OsbResult<()>;
}

/// Builds a broker client for each reconcile
pub trait BrokerClientFactory: Send + Sync + 'static {
    fn client(&self, config: BrokerConfig) -> OsbResult<Box<dyn BrokerClient>>;
}
