//! ServiceBinding Controller
//!
//! Binds ServiceBinding resources on their broker, using the record uid as
//! the OSB binding id, and stores the returned credentials in a Secret owned
//! by the binding. A Secret that disappears after the fact is recreated by
//! binding again with the same id.

use crate::controller::{validation_message, ControllerContext};
use crate::crd::{
    credentials_secret_name, managed_labels, BindingState, ServiceBinding, ServiceBindingStatus,
    BINDING_FINALIZER, CREDENTIALS_KEY,
};
use crate::error::{OperatorError, Result};
use crate::osb::{BindRequest, BindResponse, UnbindRequest};
use crate::runtime::{Action, ReconcileContext, Reconciler};
use crate::store::{
    create_owned, ensure_finalizer, generation, is_deleting, remove_finalizer, ObjectKey,
    ObjectStore, StoreError,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Reconciler for ServiceBinding resources
pub struct BindingReconciler<S> {
    ctx: ControllerContext<S>,
}

impl<S: ObjectStore> BindingReconciler<S> {
    pub fn new(ctx: ControllerContext<S>) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(namespace = %key.namespace, name = %key.name))]
    async fn reconcile_binding(&self, key: &ObjectKey, rctx: &ReconcileContext) -> Result<Action> {
        let store = self.ctx.store.as_ref();

        let Some(binding) = store
            .get::<ServiceBinding>(&key.namespace, &key.name)
            .await?
        else {
            debug!("Service binding no longer exists");
            return Ok(Action::await_change());
        };

        if is_deleting(&binding) {
            return self.cleanup(binding, rctx).await;
        }

        rctx.ensure_running()?;
        let binding = ensure_finalizer(store, binding, BINDING_FINALIZER).await?;

        let secret_name = credentials_secret_name(&key.name);
        match binding.state() {
            BindingState::Failed => {
                debug!("Service binding failed permanently");
                return Ok(Action::await_change());
            }
            BindingState::Created => {
                rctx.ensure_running()?;
                if store
                    .get::<Secret>(&key.namespace, &secret_name)
                    .await?
                    .is_some()
                {
                    debug!("Service binding settled");
                    return Ok(Action::await_change());
                }
                info!(secret = %secret_name, "Credentials secret missing, binding again");
            }
            BindingState::Pending => {}
        }

        if let Err(errors) = binding.spec.validate() {
            let message = validation_message(&errors);
            warn!(errors = %message, "Service binding spec validation failed");
            self.write_status(binding, BindingState::Failed, message)
                .await?;
            return Ok(Action::await_change());
        }

        let binding_id = binding
            .uid()
            .ok_or(OperatorError::MissingMetadata("uid"))?;

        rctx.ensure_running()?;
        let broker = match self
            .ctx
            .require_broker(&key.namespace, &binding.spec.broker_name)
            .await
        {
            Ok(broker) => broker,
            Err(e) => {
                warn!(broker = %binding.spec.broker_name, error = %e, "Broker lookup failed");
                let state = binding.state();
                self.write_status(binding, state, e.to_string()).await?;
                return Err(e);
            }
        };

        let request = BindRequest {
            binding_id: binding_id.clone(),
            instance_id: binding.spec.instance_id.clone(),
            service_id: binding.spec.service_id.clone(),
            plan_id: binding.spec.plan_id.clone(),
        };

        info!(
            binding_id = %binding_id,
            instance_id = %request.instance_id,
            "Creating service binding"
        );

        rctx.ensure_running()?;
        let result = match self.ctx.broker_client(&broker) {
            Ok(client) => client.bind(&request).await.map_err(OperatorError::from),
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(response) => response,
            Err(OperatorError::Broker(e)) if e.is_permanent() => {
                warn!(binding_id = %binding_id, error = %e, "Broker rejected bind request");
                self.write_status(binding, BindingState::Failed, format!("bind failed: {}", e))
                    .await?;
                return Ok(Action::await_change());
            }
            Err(e) => {
                warn!(binding_id = %binding_id, error = %e, "Bind request failed");
                let state = binding.state();
                self.write_status(binding, state, format!("bind failed: {}", e))
                    .await?;
                return Err(e);
            }
        };

        let secret = match build_credentials_secret(&binding, &response) {
            Ok(secret) => secret,
            Err(e) => {
                warn!(binding_id = %binding_id, error = %e, "Credentials could not be serialized");
                self.write_status(
                    binding,
                    BindingState::Failed,
                    format!("invalid credentials: {}", e),
                )
                .await?;
                return Ok(Action::await_change());
            }
        };

        rctx.ensure_running()?;
        match create_owned(store, &binding, secret).await {
            Ok(_) => debug!(secret = %secret_name, "Created credentials secret"),
            Err(StoreError::AlreadyExists(_)) => {
                debug!(secret = %secret_name, "Credentials secret already exists")
            }
            Err(e) => return Err(e.into()),
        }

        rctx.ensure_running()?;
        self.write_status(
            binding,
            BindingState::Created,
            "service binding created".to_string(),
        )
        .await?;
        info!(binding_id = %binding_id, "Service binding created");
        Ok(Action::await_change())
    }

    /// Unbind and release the finalizer; the Secret follows through cascade
    async fn cleanup(&self, binding: ServiceBinding, rctx: &ReconcileContext) -> Result<Action> {
        let store = self.ctx.store.as_ref();
        let namespace = binding.namespace().unwrap_or_else(|| "default".to_string());
        let binding_id = binding
            .uid()
            .ok_or(OperatorError::MissingMetadata("uid"))?;

        // Bind may have succeeded even though the Secret or status write did not
        if binding.state() != BindingState::Failed {
            rctx.ensure_running()?;
            let broker = self
                .ctx
                .find_broker(&namespace, &binding.spec.broker_name)
                .await?;
            match broker {
                Some(broker) => {
                    let request = UnbindRequest {
                        binding_id: binding_id.clone(),
                        instance_id: binding.spec.instance_id.clone(),
                        service_id: binding.spec.service_id.clone(),
                        plan_id: binding.spec.plan_id.clone(),
                    };
                    info!(binding_id = %binding_id, "Deleting service binding on broker");
                    rctx.ensure_running()?;
                    let client = self.ctx.broker_client(&broker)?;
                    match client.unbind(&request).await {
                        Ok(()) => {}
                        Err(e) if e.is_gone() => {
                            debug!(binding_id = %binding_id, "Binding already gone on broker");
                        }
                        Err(e) => {
                            warn!(error = %e, "Unbind request failed");
                            let state = binding.state();
                            self.write_status(binding, state, format!("unbind failed: {}", e))
                                .await?;
                            return Err(e.into());
                        }
                    }
                }
                None => {
                    warn!(
                        broker = %binding.spec.broker_name,
                        "Broker not found, skipping unbind"
                    );
                }
            }
        }

        rctx.ensure_running()?;
        remove_finalizer(store, binding, BINDING_FINALIZER).await?;
        info!(binding_id = %binding_id, "Service binding finalizer removed");
        Ok(Action::await_change())
    }

    /// Write the status, skipping the write when nothing changed
    async fn write_status(
        &self,
        mut binding: ServiceBinding,
        state: BindingState,
        message: String,
    ) -> Result<ServiceBinding> {
        let status = build_binding_status(&binding, state, message);
        if binding.status.as_ref() == Some(&status) {
            return Ok(binding);
        }
        binding.status = Some(status);
        Ok(self.ctx.store.update_status(&binding).await?)
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for BindingReconciler<S> {
    type Object = ServiceBinding;

    fn name(&self) -> &'static str {
        "binding"
    }

    async fn reconcile(&self, key: &ObjectKey, ctx: &ReconcileContext) -> Result<Action> {
        self.reconcile_binding(key, ctx).await
    }
}

fn build_binding_status(
    binding: &ServiceBinding,
    state: BindingState,
    message: String,
) -> ServiceBindingStatus {
    ServiceBindingStatus {
        state,
        message,
        observed_generation: Some(generation(binding)),
    }
}

/// Opaque Secret carrying the JSON credentials document
fn build_credentials_secret(
    binding: &ServiceBinding,
    response: &BindResponse,
) -> Result<Secret> {
    let credentials = serde_json::to_vec(&response.credentials)?;

    let mut data = BTreeMap::new();
    data.insert(CREDENTIALS_KEY.to_string(), ByteString(credentials));

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(credentials_secret_name(&binding.name_any())),
            namespace: binding.namespace(),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    })
}
