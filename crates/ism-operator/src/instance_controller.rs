//! ServiceInstance Controller
//!
//! Provisions ServiceInstance resources on their broker, using the record
//! uid as the OSB instance id, and deprovisions them on deletion once no
//! ServiceBinding refers to them any more.

use crate::controller::{validation_message, ControllerContext};
use crate::crd::{
    InstanceState, ServiceBinding, ServiceInstance, ServiceInstanceStatus, INSTANCE_FINALIZER,
};
use crate::error::{OperatorError, Result};
use crate::osb::{DeprovisionRequest, OsbError, ProvisionRequest};
use crate::runtime::{Action, ReconcileContext, Reconciler};
use crate::store::{
    ensure_finalizer, generation, is_deleting, remove_finalizer, ListFilter, ObjectKey,
    ObjectStore,
};
use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Reconciler for ServiceInstance resources
pub struct InstanceReconciler<S> {
    ctx: ControllerContext<S>,
}

impl<S: ObjectStore> InstanceReconciler<S> {
    pub fn new(ctx: ControllerContext<S>) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(namespace = %key.namespace, name = %key.name))]
    async fn reconcile_instance(&self, key: &ObjectKey, rctx: &ReconcileContext) -> Result<Action> {
        let store = self.ctx.store.as_ref();

        let Some(instance) = store
            .get::<ServiceInstance>(&key.namespace, &key.name)
            .await?
        else {
            debug!("Service instance no longer exists");
            return Ok(Action::await_change());
        };

        if is_deleting(&instance) {
            return self.cleanup(instance, rctx).await;
        }

        rctx.ensure_running()?;
        let instance = ensure_finalizer(store, instance, INSTANCE_FINALIZER).await?;

        match instance.state() {
            InstanceState::Provisioned | InstanceState::Failed => {
                debug!(state = ?instance.state(), "Service instance settled");
                return Ok(Action::await_change());
            }
            InstanceState::Pending => {}
        }

        if let Err(errors) = instance.spec.validate() {
            let message = validation_message(&errors);
            warn!(errors = %message, "Service instance spec validation failed");
            self.write_status(instance, InstanceState::Failed, message)
                .await?;
            return Ok(Action::await_change());
        }

        let instance_id = instance
            .uid()
            .ok_or(OperatorError::MissingMetadata("uid"))?;

        rctx.ensure_running()?;
        let broker = match self
            .ctx
            .require_broker(&key.namespace, &instance.spec.broker_name)
            .await
        {
            Ok(broker) => broker,
            Err(e) => {
                warn!(broker = %instance.spec.broker_name, error = %e, "Broker lookup failed");
                let state = instance.state();
                self.write_status(instance, state, e.to_string()).await?;
                return Err(e);
            }
        };

        let request = ProvisionRequest {
            instance_id: instance_id.clone(),
            service_id: instance.spec.service_id.clone(),
            plan_id: instance.spec.plan_id.clone(),
            organization_guid: key.namespace.clone(),
            space_guid: key.namespace.clone(),
        };

        info!(
            instance_id = %instance_id,
            service_id = %request.service_id,
            plan_id = %request.plan_id,
            "Provisioning service instance"
        );

        rctx.ensure_running()?;
        let result = match self.ctx.broker_client(&broker) {
            Ok(client) => client.provision(&request).await.map_err(OperatorError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.write_status(
                    instance,
                    InstanceState::Provisioned,
                    "service instance provisioned".to_string(),
                )
                .await?;
                info!(instance_id = %instance_id, "Service instance provisioned");
                Ok(Action::await_change())
            }
            Err(OperatorError::Broker(e)) if e.is_permanent() => {
                warn!(instance_id = %instance_id, error = %e, "Broker rejected provision request");
                self.write_status(
                    instance,
                    InstanceState::Failed,
                    format!("provision failed: {}", e),
                )
                .await?;
                Ok(Action::await_change())
            }
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Provision request failed");
                self.write_status(
                    instance,
                    InstanceState::Pending,
                    format!("provision failed: {}", e),
                )
                .await?;
                Err(e)
            }
        }
    }

    /// Deprovision and release the finalizer once no binding refers to the instance
    ///
    /// Only instances the broker rejected skip the Deprovision call; 410 Gone
    /// counts as success for everything else.
    async fn cleanup(&self, instance: ServiceInstance, rctx: &ReconcileContext) -> Result<Action> {
        let store = self.ctx.store.as_ref();
        let namespace = instance.namespace().unwrap_or_else(|| "default".to_string());
        let instance_id = instance
            .uid()
            .ok_or(OperatorError::MissingMetadata("uid"))?;

        let bindings: Vec<String> = store
            .list::<ServiceBinding>(Some(&namespace), &ListFilter::new())
            .await?
            .into_iter()
            .filter(|binding| binding.spec.instance_id == instance_id)
            .map(|binding| binding.name_any())
            .collect();

        if !bindings.is_empty() {
            let message = format!(
                "deletion blocked by {} service binding(s): {}",
                bindings.len(),
                bindings.join(", ")
            );
            info!(bindings = bindings.len(), "Service instance deletion blocked");
            let state = instance.state();
            rctx.ensure_running()?;
            self.write_status(instance, state, message.clone()).await?;
            return Err(OperatorError::DeletionBlocked(message));
        }

        // A pending instance may exist remotely if its status write was lost
        if instance.state() != InstanceState::Failed {
            rctx.ensure_running()?;
            let broker = self
                .ctx
                .find_broker(&namespace, &instance.spec.broker_name)
                .await?;
            match broker {
                Some(broker) => {
                    let request = DeprovisionRequest {
                        instance_id: instance_id.clone(),
                        service_id: instance.spec.service_id.clone(),
                        plan_id: instance.spec.plan_id.clone(),
                    };
                    info!(instance_id = %instance_id, "Deprovisioning service instance");
                    rctx.ensure_running()?;
                    let client = self.ctx.broker_client(&broker)?;
                    match client.deprovision(&request).await {
                        Ok(()) => {}
                        Err(e) if e.is_gone() => {
                            debug!(instance_id = %instance_id, "Instance already gone on broker");
                        }
                        Err(e) => return Err(self.deprovision_failed(instance, e).await),
                    }
                }
                None => {
                    warn!(
                        broker = %instance.spec.broker_name,
                        "Broker not found, skipping deprovision"
                    );
                }
            }
        }

        rctx.ensure_running()?;
        remove_finalizer(store, instance, INSTANCE_FINALIZER).await?;
        info!(instance_id = %instance_id, "Service instance finalizer removed");
        Ok(Action::await_change())
    }

    /// Record a failed deprovision on the instance and hand back the error to retry
    async fn deprovision_failed(&self, instance: ServiceInstance, error: OsbError) -> OperatorError {
        warn!(error = %error, "Deprovision request failed");
        let state = instance.state();
        if let Err(e) = self
            .write_status(instance, state, format!("deprovision failed: {}", error))
            .await
        {
            return e;
        }
        error.into()
    }

    /// Write the status, skipping the write when nothing changed
    async fn write_status(
        &self,
        mut instance: ServiceInstance,
        state: InstanceState,
        message: String,
    ) -> Result<ServiceInstance> {
        let status = build_instance_status(&instance, state, message);
        if instance.status.as_ref() == Some(&status) {
            return Ok(instance);
        }
        instance.status = Some(status);
        Ok(self.ctx.store.update_status(&instance).await?)
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for InstanceReconciler<S> {
    type Object = ServiceInstance;

    fn name(&self) -> &'static str {
        "instance"
    }

    async fn reconcile(&self, key: &ObjectKey, ctx: &ReconcileContext) -> Result<Action> {
        self.reconcile_instance(key, ctx).await
    }
}

fn build_instance_status(
    instance: &ServiceInstance,
    state: InstanceState,
    message: String,
) -> ServiceInstanceStatus {
    ServiceInstanceStatus {
        state,
        message,
        observed_generation: Some(generation(instance)),
    }
}
