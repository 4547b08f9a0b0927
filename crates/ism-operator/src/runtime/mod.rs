//! Watch/dispatch runtime
//!
//! A [`Controller`] turns store watch events into [`ObjectKey`]s on a
//! [`WorkQueue`] and drives a [`Reconciler`] over them with a fixed pool of
//! workers. Events on owned kinds are mapped to the owning record through
//! owner references. Every key is additionally re-listed on a resync timer.
//!
//! Reconcilers keep no state between calls: everything they act on is read
//! from the store, so a restarted operator converges the same way.

mod queue;

pub use queue::{ExponentialBackoff, WorkQueue};

use crate::error::{OperatorError, Result};
use crate::store::{ListFilter, ObjectKey, ObjectStore, StoreResult, StoredObject, WatchEvent};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::Resource;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of concurrent reconciles per controller
pub const DEFAULT_WORKERS: usize = 10;

/// Default period between full resyncs
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(600);

/// Outcome of a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile the key again after `duration`
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Nothing left to do until the record changes
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Per-call context handed to reconcilers
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    shutdown: CancellationToken,
}

impl ReconcileContext {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }

    /// Fail with [`OperatorError::ShuttingDown`] once shutdown was requested.
    ///
    /// Checked between store and broker calls so an in-flight reconcile stops
    /// at the next step boundary.
    pub fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(OperatorError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

/// Converges one record of kind [`Reconciler::Object`] per call
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Primary kind
    type Object: StoredObject;

    /// Controller name, used in logs and metric names
    fn name(&self) -> &'static str;

    /// Drive the record identified by `key` toward its spec.
    ///
    /// Returning `Err` schedules a retry with backoff.
    async fn reconcile(&self, key: &ObjectKey, ctx: &ReconcileContext) -> Result<Action>;
}

/// Runtime settings shared by all controllers
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Restrict watches and resyncs to one namespace
    pub namespace: Option<String>,
    /// Concurrent reconciles
    pub workers: usize,
    /// Period between full resyncs
    pub resync_period: Duration,
    /// Retry backoff after failed reconciles
    pub backoff: ExponentialBackoff,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: DEFAULT_WORKERS,
            resync_period: DEFAULT_RESYNC_PERIOD,
            backoff: ExponentialBackoff::default(),
        }
    }
}

/// Metrics for one controller
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        Self {
            reconciliations: metrics::counter!(format!(
                "ism_operator_{}_reconciliations_total",
                controller
            )),
            errors: metrics::counter!(format!("ism_operator_{}_errors_total", controller)),
            duration: metrics::histogram!(format!(
                "ism_operator_{}_duration_seconds",
                controller
            )),
        }
    }
}

/// Watch-driven dispatcher for one reconciler
pub struct Controller<R: Reconciler, S: ObjectStore> {
    reconciler: Arc<R>,
    store: Arc<S>,
    config: ControllerConfig,
    triggers: Vec<BoxStream<'static, ObjectKey>>,
}

impl<R: Reconciler, S: ObjectStore> Controller<R, S> {
    /// Controller watching the reconciler's primary kind
    pub fn new(reconciler: R, store: Arc<S>, config: ControllerConfig) -> Self {
        let kind = R::Object::kind(&()).to_string();
        let primary = store
            .watch::<R::Object>(config.namespace.as_deref())
            .filter_map(move |event| {
                let key = event_key(&kind, event);
                async move { key }
            })
            .boxed();
        Self {
            reconciler: Arc::new(reconciler),
            store,
            config,
            triggers: vec![primary],
        }
    }

    /// Also trigger the owner of every changed record of kind `C`
    pub fn owns<C: StoredObject>(mut self) -> Self {
        let owner_kind = R::Object::kind(&()).to_string();
        let owned_kind = C::kind(&()).to_string();
        let stream = self
            .store
            .watch::<C>(self.config.namespace.as_deref())
            .flat_map(move |event| {
                let keys = match event {
                    Ok(event) => owner_keys(event.object(), &owner_kind),
                    Err(e) => {
                        warn!(kind = %owned_kind, error = %e, "Watch error");
                        Vec::new()
                    }
                };
                stream::iter(keys)
            })
            .boxed();
        self.triggers.push(stream);
        self
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Returns once every in-flight reconcile has finished.
    pub async fn run(self, shutdown: CancellationToken) {
        let name = self.reconciler.name();
        let queue = Arc::new(WorkQueue::new(self.config.backoff, shutdown.clone()));
        let metrics = Arc::new(ControllerMetrics::new(name));

        info!(
            controller = name,
            workers = self.config.workers,
            namespace = self.config.namespace.as_deref().unwrap_or("<all>"),
            "Starting controller"
        );

        let mut background = JoinSet::new();

        let mut events = stream::select_all(self.triggers);
        {
            let queue = Arc::clone(&queue);
            let shutdown = shutdown.clone();
            background.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = events.next() => match next {
                            Some(key) => queue.add(key),
                            None => break,
                        },
                    }
                }
            });
        }

        {
            let queue = Arc::clone(&queue);
            let store = Arc::clone(&self.store);
            let namespace = self.config.namespace.clone();
            let period = self.config.resync_period;
            let shutdown = shutdown.clone();
            background.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            match resync::<R::Object, S>(&store, namespace.as_deref()).await {
                                Ok(keys) => {
                                    debug!(controller = name, count = keys.len(), "Resync");
                                    for key in keys {
                                        queue.add(key);
                                    }
                                }
                                Err(e) => warn!(controller = name, error = %e, "Resync failed"),
                            }
                        }
                    }
                }
            });
        }

        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers.max(1) {
            let queue = Arc::clone(&queue);
            let reconciler = Arc::clone(&self.reconciler);
            let metrics = Arc::clone(&metrics);
            let ctx = ReconcileContext::new(shutdown.clone());
            workers.spawn(async move {
                while let Some(key) = queue.get().await {
                    process(reconciler.as_ref(), &queue, &metrics, &ctx, &key).await;
                    queue.done(&key);
                }
            });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(controller = name, error = %e, "Worker task failed");
            }
        }
        background.shutdown().await;

        info!(controller = name, "Controller stopped");
    }
}

/// Run one reconcile and schedule its follow-up
async fn process<R: Reconciler>(
    reconciler: &R,
    queue: &Arc<WorkQueue>,
    metrics: &ControllerMetrics,
    ctx: &ReconcileContext,
    key: &ObjectKey,
) {
    let name = reconciler.name();
    let start = Instant::now();
    metrics.reconciliations.increment(1);

    let result = reconciler.reconcile(key, ctx).await;
    metrics.duration.record(start.elapsed().as_secs_f64());

    match result {
        Ok(action) => {
            queue.forget(key);
            if let Some(delay) = action.requeue_after() {
                debug!(controller = name, key = %key, delay_ms = delay.as_millis() as u64, "Requeue");
                queue.add_after(key.clone(), delay);
            }
        }
        Err(OperatorError::ShuttingDown) => {
            debug!(controller = name, key = %key, "Reconcile interrupted by shutdown");
        }
        Err(e) if !e.is_retryable() => {
            // Dropped until the next change to the record or a resync
            metrics.errors.increment(1);
            queue.forget(key);
            error!(
                controller = name,
                key = %key,
                error = %e,
                "Reconciliation failed permanently, not retrying"
            );
        }
        Err(e) => {
            metrics.errors.increment(1);
            let delay = e.requeue_delay().unwrap_or_else(|| queue.backoff(key));
            warn!(
                controller = name,
                key = %key,
                error = %e,
                retry = queue.failures(key),
                delay_ms = delay.as_millis() as u64,
                "Reconciliation error, will retry"
            );
            queue.add_after(key.clone(), delay);
        }
    }
}

/// Keys of every record of kind `K`
async fn resync<K: StoredObject, S: ObjectStore>(
    store: &S,
    namespace: Option<&str>,
) -> StoreResult<Vec<ObjectKey>> {
    let objects = store.list::<K>(namespace, &ListFilter::new()).await?;
    Ok(objects.iter().filter_map(ObjectKey::from_object).collect())
}

fn event_key<K: StoredObject>(kind: &str, event: StoreResult<WatchEvent<K>>) -> Option<ObjectKey> {
    match event {
        Ok(event) => ObjectKey::from_object(event.object()),
        Err(e) => {
            warn!(kind, error = %e, "Watch error");
            None
        }
    }
}

/// Keys of the owners of `obj` that have kind `owner_kind`
fn owner_keys<K: StoredObject>(obj: &K, owner_kind: &str) -> Vec<ObjectKey> {
    let Some(namespace) = obj.meta().namespace.clone() else {
        return Vec::new();
    };
    obj.meta()
        .owner_references
        .iter()
        .flatten()
        .filter(|owner| owner.kind == owner_kind)
        .map(|owner| ObjectKey::new(namespace.clone(), owner.name.clone()))
        .collect()
}
