//! Custom Resource Definitions for the ISM operator
//!
//! This module defines the five kinds of the `osbapi.ism.io` API group:
//! `Broker`, `BrokerService`, `BrokerServicePlan`, `ServiceInstance` and
//! `ServiceBinding`. Users write Brokers, ServiceInstances and
//! ServiceBindings; BrokerServices and BrokerServicePlans are materialized by
//! the broker controller from the broker's catalog.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{CustomResource, CustomResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of all ISM resources
pub const API_GROUP: &str = "osbapi.ism.io";

/// Finalizer held by the broker controller
pub const BROKER_FINALIZER: &str = "osbapi.ism.io/broker-finalizer";

/// Finalizer held by the service instance controller
pub const INSTANCE_FINALIZER: &str = "osbapi.ism.io/instance-finalizer";

/// Finalizer held by the service binding controller
pub const BINDING_FINALIZER: &str = "osbapi.ism.io/binding-finalizer";

/// Label carrying the owning broker's name on catalog records
pub const BROKER_NAME_LABEL: &str = "osbapi.ism.io/broker-name";

/// Label carrying the owning service's id on plan records
pub const SERVICE_ID_LABEL: &str = "osbapi.ism.io/service-id";

/// Prefix of the Secret holding a binding's credentials
pub const CREDENTIALS_SECRET_PREFIX: &str = "ism-cred-";

/// Key of the credentials document inside the Secret
pub const CREDENTIALS_KEY: &str = "credentials";

/// Regex for validating broker URLs
static URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/?#]+([/?#]\S*)?$").unwrap());

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").unwrap());

/// Validate that a broker URL is an absolute http(s) URL
fn validate_broker_url(value: &str) -> Result<(), ValidationError> {
    if URL_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_url")
            .with_message(format!("'{}' is not an http(s) URL", value).into()))
    }
}

/// Validate a Kubernetes name (RFC 1123 subdomain)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 253 {
        return Err(ValidationError::new("name_too_long")
            .with_message("name exceeds 253 characters".into()));
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

// ============================================================================
// Broker
// ============================================================================

/// Broker custom resource definition
///
/// Registers a remote Open Service Broker. The operator fetches the broker's
/// catalog once and materializes its services and plans as child records.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "osbapi.ism.io",
    version = "v1alpha1",
    kind = "Broker",
    plural = "brokers",
    shortname = "bkr",
    namespaced,
    status = "BrokerStatus",
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    /// Display name of the broker
    #[validate(length(min = 1, max = 253, message = "name must be 1-253 characters"))]
    pub name: String,

    /// Base URL of the broker
    #[validate(custom(function = "validate_broker_url"))]
    pub url: String,

    /// Basic auth username
    pub username: String,

    /// Basic auth password
    pub password: String,
}

/// Registration state of a Broker
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BrokerState {
    /// Not registered yet
    #[default]
    #[serde(rename = "")]
    Pending,
    /// Catalog fetched and materialized
    Registered,
    /// Last registration attempt failed
    RegistrationFailed,
}

/// Status of a Broker resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    /// Registration state
    #[serde(default)]
    pub state: BrokerState,

    /// Human-readable detail about the last reconcile
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Generation the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Broker {
    pub fn state(&self) -> BrokerState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }
}

// ============================================================================
// BrokerService
// ============================================================================

/// A service offering advertised by a broker's catalog.
///
/// The record name is the broker-assigned service id.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "osbapi.ism.io",
    version = "v1alpha1",
    kind = "BrokerService",
    plural = "brokerservices",
    namespaced,
    printcolumn = r#"{"name":"Service", "type":"string", "jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Broker", "type":"string", "jsonPath":".spec.brokerName"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerServiceSpec {
    /// Broker-assigned service id
    pub id: String,

    /// Service name from the catalog
    pub name: String,

    /// Service description from the catalog
    #[serde(default)]
    pub description: String,

    /// Name of the Broker record that advertised the service
    pub broker_name: String,
}

// ============================================================================
// BrokerServicePlan
// ============================================================================

/// A plan of a service offering.
///
/// Record name is `<brokerName>.<serviceId>.<planId>`, see [`plan_record_name`].
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "osbapi.ism.io",
    version = "v1alpha1",
    kind = "BrokerServicePlan",
    plural = "brokerserviceplans",
    namespaced,
    printcolumn = r#"{"name":"Plan", "type":"string", "jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Service", "type":"string", "jsonPath":".spec.serviceId"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerServicePlanSpec {
    /// Broker-assigned plan id
    pub id: String,

    /// Plan name from the catalog
    pub name: String,

    /// Plan description from the catalog
    #[serde(default)]
    pub description: String,

    /// Id of the service the plan belongs to
    pub service_id: String,
}

// ============================================================================
// ServiceInstance
// ============================================================================

/// ServiceInstance custom resource definition
///
/// Requests a provisioned instance of a broker's service and plan. The
/// record uid is used as the OSB instance id.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "osbapi.ism.io",
    version = "v1alpha1",
    kind = "ServiceInstance",
    plural = "serviceinstances",
    shortname = "si",
    namespaced,
    status = "ServiceInstanceStatus",
    printcolumn = r#"{"name":"Broker", "type":"string", "jsonPath":".spec.brokerName"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    /// Display name of the instance
    #[validate(length(min = 1, max = 253, message = "name must be 1-253 characters"))]
    pub name: String,

    /// Broker-assigned plan id
    #[validate(length(min = 1, message = "planId must not be empty"))]
    pub plan_id: String,

    /// Broker-assigned service id
    #[validate(length(min = 1, message = "serviceId must not be empty"))]
    pub service_id: String,

    /// Name of the Broker record in the same namespace
    #[validate(custom(function = "validate_k8s_name"))]
    pub broker_name: String,
}

/// Provisioning state of a ServiceInstance
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstanceState {
    /// Not provisioned yet
    #[default]
    #[serde(rename = "")]
    Pending,
    /// Broker accepted the provision request
    Provisioned,
    /// Broker permanently rejected the provision request
    Failed,
}

/// Status of a ServiceInstance resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    #[serde(default)]
    pub state: InstanceState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ServiceInstance {
    pub fn state(&self) -> InstanceState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }
}

// ============================================================================
// ServiceBinding
// ============================================================================

/// ServiceBinding custom resource definition
///
/// Requests credentials for a provisioned ServiceInstance. The record uid is
/// used as the OSB binding id; credentials land in the Secret named by
/// [`credentials_secret_name`].
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "osbapi.ism.io",
    version = "v1alpha1",
    kind = "ServiceBinding",
    plural = "servicebindings",
    shortname = "sb",
    namespaced,
    status = "ServiceBindingStatus",
    printcolumn = r#"{"name":"Instance", "type":"string", "jsonPath":".spec.instanceId"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Display name of the binding
    #[validate(length(min = 1, max = 253, message = "name must be 1-253 characters"))]
    pub name: String,

    /// Uid of the target ServiceInstance
    #[validate(length(min = 1, message = "instanceId must not be empty"))]
    pub instance_id: String,

    #[validate(length(min = 1, message = "planId must not be empty"))]
    pub plan_id: String,

    #[validate(length(min = 1, message = "serviceId must not be empty"))]
    pub service_id: String,

    /// Name of the Broker record in the same namespace
    #[validate(custom(function = "validate_k8s_name"))]
    pub broker_name: String,
}

/// Binding state of a ServiceBinding
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BindingState {
    #[default]
    #[serde(rename = "")]
    Pending,
    /// Credentials obtained and stored
    Created,
    /// Broker permanently rejected the bind request
    Failed,
}

/// Status of a ServiceBinding resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    #[serde(default)]
    pub state: BindingState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ServiceBinding {
    pub fn state(&self) -> BindingState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }
}

// ============================================================================
// Naming helpers
// ============================================================================

/// Record name of a plan: `<broker>.<service>.<plan>`
pub fn plan_record_name(broker_name: &str, service_id: &str, plan_id: &str) -> String {
    format!("{}.{}.{}", broker_name, service_id, plan_id)
}

/// Name of the Secret holding a binding's credentials
pub fn credentials_secret_name(binding_name: &str) -> String {
    format!("{}{}", CREDENTIALS_SECRET_PREFIX, binding_name)
}

/// Labels put on BrokerService records
pub fn service_labels(broker_name: &str) -> BTreeMap<String, String> {
    let mut labels = managed_labels();
    labels.insert(BROKER_NAME_LABEL.to_string(), broker_name.to_string());
    labels
}

/// Labels put on BrokerServicePlan records
pub fn plan_labels(broker_name: &str, service_id: &str) -> BTreeMap<String, String> {
    let mut labels = service_labels(broker_name);
    labels.insert(SERVICE_ID_LABEL.to_string(), service_id.to_string());
    labels
}

/// Labels put on every record the operator creates
pub fn managed_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "ism-operator".to_string(),
    );
    labels
}

/// Definitions of all five kinds, in registration order
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        Broker::crd(),
        BrokerService::crd(),
        BrokerServicePlan::crd(),
        ServiceInstance::crd(),
        ServiceBinding::crd(),
    ]
}
