//! Shared controller plumbing
//!
//! Everything the three reconcilers have in common: the store handle, the
//! broker client factory, broker lookup, and startup of the controllers.

use crate::binding_controller::BindingReconciler;
use crate::broker_controller::BrokerReconciler;
use crate::config::OperatorConfig;
use crate::crd::{Broker, BrokerService};
use crate::error::{OperatorError, Result};
use crate::instance_controller::InstanceReconciler;
use crate::osb::{BrokerClient, BrokerClientFactory, BrokerConfig, DEFAULT_BROKER_TIMEOUT};
use crate::runtime::Controller;
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::Secret;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use validator::ValidationErrors;

/// Run the broker, instance and binding controllers until `shutdown` fires.
///
/// Returns after every in-flight reconcile has finished.
pub async fn run_controllers<S: ObjectStore>(
    store: Arc<S>,
    brokers: Arc<dyn BrokerClientFactory>,
    config: &OperatorConfig,
    shutdown: CancellationToken,
) {
    let ctx = ControllerContext::new(store.clone(), brokers)
        .with_broker_timeout(config.broker_timeout);
    let runtime = config.controller_config();

    let broker_controller = Controller::new(
        BrokerReconciler::new(ctx.clone()),
        store.clone(),
        runtime.clone(),
    )
    .owns::<BrokerService>();
    let instance_controller = Controller::new(
        InstanceReconciler::new(ctx.clone()),
        store.clone(),
        runtime.clone(),
    );
    let binding_controller =
        Controller::new(BindingReconciler::new(ctx), store, runtime).owns::<Secret>();

    tokio::join!(
        broker_controller.run(shutdown.clone()),
        instance_controller.run(shutdown.clone()),
        binding_controller.run(shutdown),
    );

    info!("All controllers stopped");
}

/// Context passed to the reconcilers
pub struct ControllerContext<S> {
    /// Object store gateway
    pub store: Arc<S>,
    /// Builds a broker client per reconcile
    pub brokers: Arc<dyn BrokerClientFactory>,
    /// Timeout of each broker request
    pub broker_timeout: Duration,
}

impl<S> Clone for ControllerContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            brokers: Arc::clone(&self.brokers),
            broker_timeout: self.broker_timeout,
        }
    }
}

impl<S: ObjectStore> ControllerContext<S> {
    pub fn new(store: Arc<S>, brokers: Arc<dyn BrokerClientFactory>) -> Self {
        Self {
            store,
            brokers,
            broker_timeout: DEFAULT_BROKER_TIMEOUT,
        }
    }

    pub fn with_broker_timeout(mut self, timeout: Duration) -> Self {
        self.broker_timeout = timeout;
        self
    }

    /// Look up the Broker record `name` in `namespace`
    pub async fn find_broker(&self, namespace: &str, name: &str) -> Result<Option<Broker>> {
        Ok(self.store.get::<Broker>(namespace, name).await?)
    }

    /// Look up a referenced Broker; a missing one is [`OperatorError::BrokerNotFound`]
    pub async fn require_broker(&self, namespace: &str, name: &str) -> Result<Broker> {
        self.find_broker(namespace, name)
            .await?
            .ok_or_else(|| OperatorError::BrokerNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    /// Fresh client for `broker`; clients are never cached across reconciles
    pub fn broker_client(&self, broker: &Broker) -> Result<Box<dyn BrokerClient>> {
        let config = BrokerConfig::from_broker(broker, self.broker_timeout);
        Ok(self.brokers.client(config)?)
    }
}

/// Flatten validation errors into one status message
pub fn validation_message(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => format!("{}: {}", field, message),
                None => format!("{}: {}", field, e.code),
            })
        })
        .collect();
    messages.sort();
    messages.join("; ")
}
