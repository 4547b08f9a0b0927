//! Broker Controller
//!
//! Registers Broker resources: fetches the broker's catalog once and
//! materializes it as BrokerService records owned by the Broker and
//! BrokerServicePlan records owned by their service. Brokers advertising the
//! same service id share its record, each holding an owner reference.
//! Deletion waits until no ServiceInstance references the broker; the
//! broker's plans are then deleted and its services go through owner-reference
//! cascade once no other broker owns them.

use crate::controller::{validation_message, ControllerContext};
use crate::crd::{
    plan_labels, plan_record_name, service_labels, Broker, BrokerService, BrokerServicePlan,
    BrokerServicePlanSpec, BrokerServiceSpec, BrokerState, BrokerStatus, ServiceInstance,
    BROKER_FINALIZER, BROKER_NAME_LABEL,
};
use crate::error::{OperatorError, Result};
use crate::osb::{Catalog, CatalogPlan, CatalogService};
use crate::runtime::{Action, ReconcileContext, Reconciler};
use crate::store::{
    add_owner, create_owned, ensure_finalizer, generation, is_deleting, remove_finalizer, ListFilter,
    ObjectKey, ObjectStore, StoreError,
};
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Reconciler for Broker resources
pub struct BrokerReconciler<S> {
    ctx: ControllerContext<S>,
}

impl<S: ObjectStore> BrokerReconciler<S> {
    pub fn new(ctx: ControllerContext<S>) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(namespace = %key.namespace, name = %key.name))]
    async fn reconcile_broker(&self, key: &ObjectKey, rctx: &ReconcileContext) -> Result<Action> {
        let store = self.ctx.store.as_ref();

        let Some(broker) = store.get::<Broker>(&key.namespace, &key.name).await? else {
            debug!("Broker no longer exists");
            return Ok(Action::await_change());
        };

        if is_deleting(&broker) {
            return self.cleanup(broker, rctx).await;
        }

        rctx.ensure_running()?;
        let broker = ensure_finalizer(store, broker, BROKER_FINALIZER).await?;

        if broker.state() == BrokerState::Registered {
            debug!("Broker already registered");
            return Ok(Action::await_change());
        }

        if let Err(errors) = broker.spec.validate() {
            let message = validation_message(&errors);
            warn!(errors = %message, "Broker spec validation failed");
            self.write_status(broker, BrokerState::RegistrationFailed, message)
                .await?;
            return Ok(Action::await_change());
        }

        info!(url = %broker.spec.url, "Registering broker");

        rctx.ensure_running()?;
        let catalog = match self.fetch_catalog(&broker).await {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(error = %e, "Failed to fetch catalog");
                self.write_status(
                    broker,
                    BrokerState::RegistrationFailed,
                    format!("failed to fetch catalog: {}", e),
                )
                .await?;
                return Err(e);
            }
        };

        if let Err(e) = self.materialize(&broker, &catalog, rctx).await {
            if let OperatorError::DuplicateService(ref id) = e {
                warn!(service_id = %id, "Catalog lists a service id twice");
                self.write_status(broker, BrokerState::RegistrationFailed, e.to_string())
                    .await?;
            }
            return Err(e);
        }

        rctx.ensure_running()?;
        self.write_status(
            broker,
            BrokerState::Registered,
            "broker registered".to_string(),
        )
        .await?;

        info!(
            services = catalog.services.len(),
            plans = catalog.services.iter().map(|s| s.plans.len()).sum::<usize>(),
            "Broker registered"
        );
        Ok(Action::await_change())
    }

    async fn fetch_catalog(&self, broker: &Broker) -> Result<Catalog> {
        let client = self.ctx.broker_client(broker)?;
        Ok(client.catalog().await?)
    }

    /// Create the service and plan records of `catalog`, in catalog order
    async fn materialize(
        &self,
        broker: &Broker,
        catalog: &Catalog,
        rctx: &ReconcileContext,
    ) -> Result<()> {
        let mut seen = HashSet::new();

        for service in &catalog.services {
            if !seen.insert(service.id.as_str()) {
                return Err(OperatorError::DuplicateService(service.id.clone()));
            }

            rctx.ensure_running()?;
            let record = self.ensure_service(broker, service).await?;

            for plan in &service.plans {
                rctx.ensure_running()?;
                self.ensure_plan(broker, &record, service, plan).await?;
            }
        }

        Ok(())
    }

    async fn ensure_service(
        &self,
        broker: &Broker,
        service: &CatalogService,
    ) -> Result<BrokerService> {
        let store = self.ctx.store.as_ref();
        let namespace = broker.namespace().unwrap_or_else(|| "default".to_string());
        let record = build_service(broker, service);

        match create_owned(store, broker, record).await {
            Ok(created) => {
                debug!(service_id = %service.id, "Created broker service");
                Ok(created)
            }
            Err(StoreError::AlreadyExists(_)) => {
                let existing = store
                    .get::<BrokerService>(&namespace, &service.id)
                    .await?
                    .ok_or_else(|| {
                        OperatorError::Store(StoreError::NotFound(format!(
                            "BrokerService/{}/{}",
                            namespace, service.id
                        )))
                    })?;
                // Shared with another broker: keep it alive while either exists
                let record = add_owner(store, broker, existing).await?;
                debug!(service_id = %service.id, "Broker service already exists");
                Ok(record)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_plan(
        &self,
        broker: &Broker,
        service_record: &BrokerService,
        service: &CatalogService,
        plan: &CatalogPlan,
    ) -> Result<()> {
        let record = build_plan(broker, service, plan);

        match create_owned(self.ctx.store.as_ref(), service_record, record).await {
            Ok(_) => {
                debug!(service_id = %service.id, plan_id = %plan.id, "Created broker service plan");
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Let the Broker go once no ServiceInstance references it.
    ///
    /// Services go through cascade once no other broker owns them.
    async fn cleanup(&self, broker: Broker, rctx: &ReconcileContext) -> Result<Action> {
        let store = self.ctx.store.as_ref();
        let name = broker.name_any();
        let namespace = broker.namespace().unwrap_or_else(|| "default".to_string());

        let blocking: Vec<String> = store
            .list::<ServiceInstance>(Some(&namespace), &ListFilter::new())
            .await?
            .into_iter()
            .filter(|instance| instance.spec.broker_name == name)
            .map(|instance| instance.name_any())
            .collect();

        if !blocking.is_empty() {
            let message = deletion_blocked_message(&blocking);
            info!(instances = blocking.len(), "Broker deletion blocked");
            let state = broker.state();
            rctx.ensure_running()?;
            self.write_status(broker, state, message.clone()).await?;
            return Err(OperatorError::DeletionBlocked(message));
        }

        // Plans of a shared service outlive it, so drop this broker's own
        let plans = store
            .list::<BrokerServicePlan>(
                Some(&namespace),
                &ListFilter::new().label(BROKER_NAME_LABEL, name.as_str()),
            )
            .await?;
        for plan in plans {
            rctx.ensure_running()?;
            store
                .delete::<BrokerServicePlan>(&namespace, &plan.name_any())
                .await?;
        }

        rctx.ensure_running()?;
        remove_finalizer(store, broker, BROKER_FINALIZER).await?;
        info!("Broker finalizer removed");
        Ok(Action::await_change())
    }

    /// Write the status, skipping the write when nothing changed
    async fn write_status(
        &self,
        mut broker: Broker,
        state: BrokerState,
        message: String,
    ) -> Result<Broker> {
        let status = build_broker_status(&broker, state, message);
        if broker.status.as_ref() == Some(&status) {
            return Ok(broker);
        }
        broker.status = Some(status);
        Ok(self.ctx.store.update_status(&broker).await?)
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for BrokerReconciler<S> {
    type Object = Broker;

    fn name(&self) -> &'static str {
        "broker"
    }

    async fn reconcile(&self, key: &ObjectKey, ctx: &ReconcileContext) -> Result<Action> {
        self.reconcile_broker(key, ctx).await
    }
}

fn build_broker_status(broker: &Broker, state: BrokerState, message: String) -> BrokerStatus {
    BrokerStatus {
        state,
        message,
        observed_generation: Some(generation(broker)),
    }
}

fn build_service(broker: &Broker, service: &CatalogService) -> BrokerService {
    let broker_name = broker.name_any();
    let mut record = BrokerService::new(
        &service.id,
        BrokerServiceSpec {
            id: service.id.clone(),
            name: service.name.clone(),
            description: service.description.clone(),
            broker_name: broker_name.clone(),
        },
    );
    record.metadata.namespace = broker.namespace();
    record.metadata.labels = Some(service_labels(&broker_name));
    record
}

fn build_plan(broker: &Broker, service: &CatalogService, plan: &CatalogPlan) -> BrokerServicePlan {
    let broker_name = broker.name_any();
    let mut record = BrokerServicePlan::new(
        &plan_record_name(&broker_name, &service.id, &plan.id),
        BrokerServicePlanSpec {
            id: plan.id.clone(),
            name: plan.name.clone(),
            description: plan.description.clone(),
            service_id: service.id.clone(),
        },
    );
    record.metadata.namespace = broker.namespace();
    record.metadata.labels = Some(plan_labels(&broker_name, &service.id));
    record
}

fn deletion_blocked_message(instances: &[String]) -> String {
    format!(
        "deletion blocked by {} service instance(s): {}",
        instances.len(),
        instances.join(", ")
    )
}
