//! In-process backend for the object store gateway
//!
//! Records are kept as JSON documents keyed by kind, namespace and name, the
//! same shape the API server stores. The store stamps uids, resource versions
//! and generations, enforces optimistic concurrency, honors finalizers and
//! garbage-collects owner-reference descendants when a parent is removed.

use super::{
    ListFilter, ObjectStore, StoreError, StoreResult, StoredObject, WatchEvent,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of the watch fan-out channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Write operations a fault can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Create,
    Update,
    UpdateStatus,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RecordKey {
    kind: String,
    namespace: String,
    name: String,
}

#[derive(Debug, Clone)]
struct RawEvent {
    kind: String,
    namespace: String,
    event_type: EventType,
    object: Value,
}

#[derive(Debug, Clone)]
struct Fault {
    kind: String,
    operation: StoreOperation,
    /// Commit the write first, then report failure
    after_commit: bool,
}

#[derive(Default)]
struct State {
    records: BTreeMap<RecordKey, Value>,
    resource_version: u64,
    faults: Vec<Fault>,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn take_fault(
        &mut self,
        kind: &str,
        operation: StoreOperation,
        after_commit: bool,
    ) -> StoreResult<()> {
        let position = self.faults.iter().position(|f| {
            f.kind == kind && f.operation == operation && f.after_commit == after_commit
        });
        match position {
            Some(index) => {
                self.faults.remove(index);
                Err(StoreError::Injected(format!(
                    "{:?} {} ({})",
                    operation,
                    kind,
                    if after_commit {
                        "after commit"
                    } else {
                        "before commit"
                    }
                )))
            }
            None => Ok(()),
        }
    }
}

/// In-memory object store with API-server semantics
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<RawEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Fail the next `operation` on records of `kind` without applying it
    pub fn fail_next(&self, kind: &str, operation: StoreOperation) {
        self.push_fault(kind, operation, false);
    }

    /// Apply the next `operation` on records of `kind`, then report failure.
    ///
    /// Models a controller crash right after a successful write.
    pub fn crash_after_next(&self, kind: &str, operation: StoreOperation) {
        self.push_fault(kind, operation, true);
    }

    fn push_fault(&self, kind: &str, operation: StoreOperation, after_commit: bool) {
        self.state.lock().faults.push(Fault {
            kind: kind.to_string(),
            operation,
            after_commit,
        });
    }

    fn emit(&self, event_type: EventType, key: &RecordKey, object: Value) {
        // No receivers is fine: nothing is watching yet
        let _ = self.events.send(RawEvent {
            kind: key.kind.clone(),
            namespace: key.namespace.clone(),
            event_type,
            object,
        });
    }

    /// Remove a record and garbage-collect its dependents.
    ///
    /// A dependent is collected once none of its owners exists any more;
    /// until then it only loses the reference to the removed owner.
    /// Dependents that carry finalizers are only marked as deleting.
    fn remove_with_dependents(&self, state: &mut State, key: RecordKey) -> StoreResult<()> {
        let mut pending = vec![key];

        while let Some(key) = pending.pop() {
            let Some(value) = state.records.remove(&key) else {
                continue;
            };
            let uid = meta_of(&value)?.uid;
            debug!(kind = %key.kind, namespace = %key.namespace, name = %key.name, "Record removed");
            self.emit(EventType::Deleted, &key, value);

            let Some(uid) = uid else {
                continue;
            };

            let mut dependents = Vec::new();
            for (dep_key, dep_value) in &state.records {
                if dep_key.namespace != key.namespace {
                    continue;
                }
                let meta = meta_of(dep_value)?;
                if ListFilter::new().owned_by(uid.as_str()).matches(&meta) {
                    dependents.push((dep_key.clone(), meta));
                }
            }

            let live = live_uids(state, &key.namespace)?;
            for (dep_key, mut meta) in dependents {
                let survives = meta
                    .owner_references
                    .iter()
                    .flatten()
                    .any(|owner| owner.uid != uid && live.contains(owner.uid.as_str()));
                if survives {
                    // Another owner is still around: only drop the stale reference
                    if let Some(owners) = meta.owner_references.as_mut() {
                        owners.retain(|owner| owner.uid != uid);
                    }
                    meta.resource_version = Some(state.next_resource_version());
                    if let Some(value) = state.records.get_mut(&dep_key) {
                        set_meta(value, &meta)?;
                        let snapshot = value.clone();
                        self.emit(EventType::Modified, &dep_key, snapshot);
                    }
                } else if has_finalizers(&meta) {
                    if meta.deletion_timestamp.is_none() {
                        meta.deletion_timestamp = Some(Time(Utc::now()));
                        meta.resource_version = Some(state.next_resource_version());
                        if let Some(value) = state.records.get_mut(&dep_key) {
                            set_meta(value, &meta)?;
                            let snapshot = value.clone();
                            self.emit(EventType::Modified, &dep_key, snapshot);
                        }
                    }
                } else {
                    pending.push(dep_key);
                }
            }
        }

        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_of<K: StoredObject>() -> String {
    K::kind(&()).to_string()
}

fn object_mut(value: &mut Value) -> StoreResult<&mut Map<String, Value>> {
    value
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidRecord("record is not a JSON object".to_string()))
}

fn meta_of(value: &Value) -> StoreResult<ObjectMeta> {
    match value.get("metadata") {
        Some(meta) => Ok(serde_json::from_value(meta.clone())?),
        None => Ok(ObjectMeta::default()),
    }
}

fn set_meta(value: &mut Value, meta: &ObjectMeta) -> StoreResult<()> {
    let meta = serde_json::to_value(meta)?;
    object_mut(value)?.insert("metadata".to_string(), meta);
    Ok(())
}

/// Everything but metadata and status: the part whose change bumps `generation`
fn desired_state(value: &Value) -> Map<String, Value> {
    let mut body = value.as_object().cloned().unwrap_or_default();
    body.remove("metadata");
    body.remove("status");
    body
}

/// Uids of every record in `namespace`
fn live_uids(state: &State, namespace: &str) -> StoreResult<HashSet<String>> {
    let mut uids = HashSet::new();
    for (key, value) in &state.records {
        if key.namespace == namespace {
            if let Some(uid) = meta_of(value)?.uid {
                uids.insert(uid);
            }
        }
    }
    Ok(uids)
}

fn has_finalizers(meta: &ObjectMeta) -> bool {
    meta.finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

fn record_key<K: StoredObject>(meta: &ObjectMeta) -> StoreResult<RecordKey> {
    Ok(RecordKey {
        kind: kind_of::<K>(),
        namespace: meta
            .namespace
            .clone()
            .ok_or(StoreError::MissingMetadata("namespace"))?,
        name: meta
            .name
            .clone()
            .ok_or(StoreError::MissingMetadata("name"))?,
    })
}

fn describe(key: &RecordKey) -> String {
    format!("{}/{}/{}", key.kind, key.namespace, key.name)
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoredObject>(&self, namespace: &str, name: &str) -> StoreResult<Option<K>> {
        let key = RecordKey {
            kind: kind_of::<K>(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        let value = self.state.lock().records.get(&key).cloned();
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn list<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        filter: &ListFilter,
    ) -> StoreResult<Vec<K>> {
        let kind = kind_of::<K>();
        let values: Vec<Value> = {
            let state = self.state.lock();
            state
                .records
                .iter()
                .filter(|(key, _)| {
                    key.kind == kind && namespace.map_or(true, |ns| key.namespace == ns)
                })
                .map(|(_, value)| value.clone())
                .collect()
        };

        let mut items = Vec::new();
        for value in values {
            let meta = meta_of(&value)?;
            if filter.matches(&meta) {
                items.push((meta.name.unwrap_or_default(), serde_json::from_value(value)?));
            }
        }
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items.into_iter().map(|(_, obj)| obj).collect())
    }

    async fn create<K: StoredObject>(&self, obj: &K) -> StoreResult<K> {
        let mut value = serde_json::to_value(obj)?;
        let mut meta = meta_of(&value)?;
        let key = record_key::<K>(&meta)?;

        let mut state = self.state.lock();
        state.take_fault(&key.kind, StoreOperation::Create, false)?;

        if state.records.contains_key(&key) {
            return Err(StoreError::AlreadyExists(describe(&key)));
        }

        meta.uid = Some(Uuid::new_v4().to_string());
        meta.resource_version = Some(state.next_resource_version());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;
        set_meta(&mut value, &meta)?;
        // Status is a sub-resource: it is never written on create
        object_mut(&mut value)?.remove("status");

        state.records.insert(key.clone(), value.clone());
        self.emit(EventType::Added, &key, value.clone());
        state.take_fault(&key.kind, StoreOperation::Create, true)?;

        Ok(serde_json::from_value(value)?)
    }

    async fn update<K: StoredObject>(&self, obj: &K) -> StoreResult<K> {
        let mut value = serde_json::to_value(obj)?;
        let mut meta = meta_of(&value)?;
        let key = record_key::<K>(&meta)?;

        let mut state = self.state.lock();
        state.take_fault(&key.kind, StoreOperation::Update, false)?;

        let stored = state
            .records
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(describe(&key)))?;
        let stored_meta = meta_of(&stored)?;

        if meta.resource_version != stored_meta.resource_version {
            return Err(StoreError::Conflict(describe(&key)));
        }

        let spec_changed = desired_state(&value) != desired_state(&stored);
        let stored_generation = stored_meta.generation.unwrap_or(1);

        meta.uid = stored_meta.uid;
        meta.creation_timestamp = stored_meta.creation_timestamp;
        meta.deletion_timestamp = stored_meta.deletion_timestamp;
        meta.generation = Some(if spec_changed {
            stored_generation + 1
        } else {
            stored_generation
        });
        meta.resource_version = Some(state.next_resource_version());
        set_meta(&mut value, &meta)?;

        let body = object_mut(&mut value)?;
        match stored.get("status") {
            Some(status) => {
                body.insert("status".to_string(), status.clone());
            }
            None => {
                body.remove("status");
            }
        }

        if meta.deletion_timestamp.is_some() && !has_finalizers(&meta) {
            state.records.insert(key.clone(), value.clone());
            self.remove_with_dependents(&mut state, key.clone())?;
        } else {
            state.records.insert(key.clone(), value.clone());
            self.emit(EventType::Modified, &key, value.clone());
        }
        state.take_fault(&key.kind, StoreOperation::Update, true)?;

        Ok(serde_json::from_value(value)?)
    }

    async fn update_status<K: StoredObject>(&self, obj: &K) -> StoreResult<K> {
        let value = serde_json::to_value(obj)?;
        let meta = meta_of(&value)?;
        let key = record_key::<K>(&meta)?;

        let mut state = self.state.lock();
        state.take_fault(&key.kind, StoreOperation::UpdateStatus, false)?;

        let mut stored = state
            .records
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(describe(&key)))?;
        let mut stored_meta = meta_of(&stored)?;

        if meta.resource_version != stored_meta.resource_version {
            return Err(StoreError::Conflict(describe(&key)));
        }

        stored_meta.resource_version = Some(state.next_resource_version());
        set_meta(&mut stored, &stored_meta)?;
        let body = object_mut(&mut stored)?;
        match value.get("status") {
            Some(status) => {
                body.insert("status".to_string(), status.clone());
            }
            None => {
                body.remove("status");
            }
        }

        state.records.insert(key.clone(), stored.clone());
        self.emit(EventType::Modified, &key, stored.clone());
        state.take_fault(&key.kind, StoreOperation::UpdateStatus, true)?;

        Ok(serde_json::from_value(stored)?)
    }

    async fn delete<K: StoredObject>(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let key = RecordKey {
            kind: kind_of::<K>(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };

        let mut state = self.state.lock();
        state.take_fault(&key.kind, StoreOperation::Delete, false)?;

        let Some(stored) = state.records.get(&key).cloned() else {
            return Ok(());
        };
        let mut meta = meta_of(&stored)?;

        if has_finalizers(&meta) {
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(Time(Utc::now()));
                meta.resource_version = Some(state.next_resource_version());
                let mut value = stored;
                set_meta(&mut value, &meta)?;
                state.records.insert(key.clone(), value.clone());
                self.emit(EventType::Modified, &key, value);
            }
        } else {
            self.remove_with_dependents(&mut state, key.clone())?;
        }
        state.take_fault(&key.kind, StoreOperation::Delete, true)?;

        Ok(())
    }

    fn watch<K: StoredObject>(
        &self,
        namespace: Option<&str>,
    ) -> BoxStream<'static, StoreResult<WatchEvent<K>>> {
        let receiver = self.events.subscribe();
        let kind = kind_of::<K>();
        let namespace = namespace.map(str::to_string);

        futures::stream::unfold(receiver, move |mut receiver| {
            let kind = kind.clone();
            let namespace = namespace.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            if event.kind != kind
                                || namespace.as_ref().is_some_and(|ns| *ns != event.namespace)
                            {
                                continue;
                            }
                            let item = serde_json::from_value::<K>(event.object)
                                .map_err(StoreError::from)
                                .map(|obj| match event.event_type {
                                    EventType::Added => WatchEvent::Added(obj),
                                    EventType::Modified => WatchEvent::Modified(obj),
                                    EventType::Deleted => WatchEvent::Deleted(obj),
                                });
                            return Some((item, receiver));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(kind = %kind, skipped, "Watch fell behind, events dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{add_owner, create_owned, ensure_finalizer, owned_by, remove_finalizer};
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::collections::{BTreeMap, HashSet};

    fn config_map(name: &str, value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("key".to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("a", "1")).await.unwrap();

        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());
        assert_eq!(created.metadata.generation, Some(1));
        assert!(created.metadata.creation_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_create_conflicting_name() {
        let store = MemoryStore::new();
        store.create(&config_map("a", "1")).await.unwrap();

        let err = store.create(&config_map("a", "2")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_update_requires_current_resource_version() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("a", "1")).await.unwrap();

        let mut first = created.clone();
        first.data = Some(BTreeMap::from([("key".to_string(), "2".to_string())]));
        let updated = store.update(&first).await.unwrap();
        assert_eq!(updated.metadata.generation, Some(2));

        // Second writer still holds the original resource version
        let mut stale = created;
        stale.data = Some(BTreeMap::from([("key".to_string(), "3".to_string())]));
        let err = store.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_metadata_only_update_keeps_generation() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("a", "1")).await.unwrap();

        let updated = ensure_finalizer(&store, created, "test/finalizer")
            .await
            .unwrap();
        assert_eq!(updated.metadata.generation, Some(1));
        assert_eq!(
            updated.metadata.finalizers,
            Some(vec!["test/finalizer".to_string()])
        );
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("a", "1")).await.unwrap();
        ensure_finalizer(&store, created, "test/finalizer")
            .await
            .unwrap();

        store.delete::<ConfigMap>("default", "a").await.unwrap();
        let deleting: ConfigMap = store.get("default", "a").await.unwrap().unwrap();
        assert!(deleting.metadata.deletion_timestamp.is_some());

        remove_finalizer(&store, deleting, "test/finalizer")
            .await
            .unwrap();
        assert!(store
            .get::<ConfigMap>("default", "a")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_cascades_to_owned_records() {
        let store = MemoryStore::new();
        let parent = store.create(&config_map("parent", "1")).await.unwrap();
        let child = create_owned(&store, &parent, config_map("child", "1"))
            .await
            .unwrap();
        create_owned(&store, &child, config_map("grandchild", "1"))
            .await
            .unwrap();
        store.create(&config_map("unrelated", "1")).await.unwrap();

        store.delete::<ConfigMap>("default", "parent").await.unwrap();

        let remaining: Vec<ConfigMap> = store.list(None, &ListFilter::new()).await.unwrap();
        let names: Vec<_> = remaining
            .iter()
            .filter_map(|cm| cm.metadata.name.clone())
            .collect();
        assert_eq!(names, vec!["unrelated".to_string()]);
    }

    #[tokio::test]
    async fn test_shared_dependent_outlives_one_owner() {
        let store = MemoryStore::new();
        let first = store.create(&config_map("first", "1")).await.unwrap();
        let second = store.create(&config_map("second", "1")).await.unwrap();
        let shared = create_owned(&store, &first, config_map("shared", "1"))
            .await
            .unwrap();
        let shared = add_owner(&store, &second, shared).await.unwrap();
        assert_eq!(shared.metadata.owner_references.as_ref().unwrap().len(), 2);

        // Adding the same owner twice leaves the record alone
        let again = add_owner(&store, &second, shared.clone()).await.unwrap();
        assert_eq!(again.metadata.resource_version, shared.metadata.resource_version);

        store.delete::<ConfigMap>("default", "first").await.unwrap();
        let shared: ConfigMap = store.get("default", "shared").await.unwrap().unwrap();
        let owners = shared.metadata.owner_references.clone().unwrap();
        assert_eq!(owners.len(), 1);
        assert!(owned_by(&shared, second.metadata.uid.as_deref().unwrap()));

        store.delete::<ConfigMap>("default", "second").await.unwrap();
        assert!(store
            .get::<ConfigMap>("default", "shared")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::new();

        store.fail_next("ConfigMap", StoreOperation::Create);
        assert!(store.create(&config_map("a", "1")).await.is_err());
        assert!(store
            .get::<ConfigMap>("default", "a")
            .await
            .unwrap()
            .is_none());

        store.crash_after_next("ConfigMap", StoreOperation::Create);
        assert!(store.create(&config_map("a", "1")).await.is_err());
        assert!(store
            .get::<ConfigMap>("default", "a")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_watch_reports_lifecycle() {
        let store = MemoryStore::new();
        let mut events = store.watch::<ConfigMap>(Some("default"));

        let created = store.create(&config_map("a", "1")).await.unwrap();
        let mut changed = created.clone();
        changed.data = Some(BTreeMap::from([("key".to_string(), "2".to_string())]));
        store.update(&changed).await.unwrap();
        store.delete::<ConfigMap>("default", "a").await.unwrap();

        assert!(matches!(
            events.next().await.unwrap().unwrap(),
            WatchEvent::Added(_)
        ));
        assert!(matches!(
            events.next().await.unwrap().unwrap(),
            WatchEvent::Modified(_)
        ));
        assert!(matches!(
            events.next().await.unwrap().unwrap(),
            WatchEvent::Deleted(_)
        ));
    }
}
