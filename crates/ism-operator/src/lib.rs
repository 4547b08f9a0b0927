//! # ISM Kubernetes Operator
//!
//! Kubernetes operator that drives Open Service Broker (OSB) APIs from
//! declarative resources.
//!
//! Users register brokers, request service instances and request bindings by
//! writing custom resources. The operator fetches catalogs, provisions,
//! binds, and stores the returned credentials in Secrets, and undoes all of
//! it again when the resources are deleted.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ism_operator::prelude::*;
//! use kube::Client;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::try_default().await?;
//!     let store = Arc::new(KubeStore::new(client));
//!     let config = OperatorConfig::default().validated()?;
//!
//!     run_controllers(store, Arc::new(HttpClientFactory), &config, CancellationToken::new())
//!         .await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Watch**: the [`runtime`] turns store events on each primary kind, and
//!    on the kinds it owns, into work-queue keys
//! 2. **Reconcile**: one reconciler per kind converges a single record per
//!    call, reading everything it needs from the store
//! 3. **Act**: broker calls go through the [`osb::BrokerClient`] trait
//! 4. **Status**: state, message and `observedGeneration` are written back
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`store`] - Object store gateway (Kubernetes and in-memory backends)
//! - [`osb`] - Open Service Broker client
//! - [`runtime`] - Watch/dispatch runtime and work queue
//! - [`broker_controller`] - Broker registration
//! - [`instance_controller`] - ServiceInstance provisioning
//! - [`binding_controller`] - ServiceBinding credentials
//! - [`controller`] - Shared reconciler context and controller startup
//! - [`config`] - Operator settings
//! - [`error`] - Error types for operator operations
//!
//! ## Custom Resource Definitions
//!
//! ```yaml
//! apiVersion: osbapi.ism.io/v1alpha1
//! kind: Broker
//! metadata:
//!   name: b1
//! spec:
//!   name: b1
//!   url: http://broker.example.com
//!   username: admin
//!   password: secret
//! ---
//! apiVersion: osbapi.ism.io/v1alpha1
//! kind: ServiceInstance
//! metadata:
//!   name: i1
//! spec:
//!   name: i1
//!   brokerName: b1
//!   serviceId: s1
//!   planId: p1
//! ---
//! apiVersion: osbapi.ism.io/v1alpha1
//! kind: ServiceBinding
//! metadata:
//!   name: bnd1
//! spec:
//!   name: bnd1
//!   instanceId: <uid of i1>
//!   brokerName: b1
//!   serviceId: s1
//!   planId: p1
//! ```
//!
//! ## Metrics
//!
//! Per controller (`broker`, `instance`, `binding`):
//!
//! - `ism_operator_<controller>_reconciliations_total`
//! - `ism_operator_<controller>_errors_total`
//! - `ism_operator_<controller>_duration_seconds`

pub mod binding_controller;
pub mod broker_controller;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod instance_controller;
pub mod osb;
pub mod runtime;
pub mod store;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::binding_controller::BindingReconciler;
    pub use crate::broker_controller::BrokerReconciler;
    pub use crate::config::OperatorConfig;
    pub use crate::controller::{run_controllers, ControllerContext};
    pub use crate::crd::{
        BindingState, Broker, BrokerService, BrokerServicePlan, BrokerServicePlanSpec,
        BrokerServiceSpec, BrokerSpec, BrokerState, BrokerStatus, InstanceState, ServiceBinding,
        ServiceBindingSpec, ServiceBindingStatus, ServiceInstance, ServiceInstanceSpec,
        ServiceInstanceStatus,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::instance_controller::InstanceReconciler;
    pub use crate::osb::{
        BrokerClient, BrokerClientFactory, BrokerConfig, HttpBrokerClient, HttpClientFactory,
        OsbError,
    };
    pub use crate::runtime::{Action, Controller, ControllerConfig, ReconcileContext, Reconciler};
    pub use crate::store::{KubeStore, MemoryStore, ObjectKey, ObjectStore, StoreError};
}
