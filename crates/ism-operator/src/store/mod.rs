//! Object Store Gateway
//!
//! Typed access to the persistent, versioned object store the controllers
//! reconcile against. Every controller talks to the store through the
//! [`ObjectStore`] trait, which has two backends:
//!
//! - [`KubeStore`] - the Kubernetes API server via `kube::Api`
//! - [`MemoryStore`] - an in-process store with the same semantics
//!   (resource versions, generations, finalizers, owner-reference cascade),
//!   used by tests and local runs
//!
//! The helpers in this module are the only place that touches finalizer
//! lists, owner references and generation bookkeeping.

mod kubernetes;
mod memory;

pub use kubernetes::KubeStore;
pub use memory::{MemoryStore, StoreOperation};

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Debug;
use thiserror::Error;

/// Errors returned by the object store gateway
#[derive(Error, Debug)]
pub enum StoreError {
    /// Record does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// A record with the same name already exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The record's resource version is stale
    #[error("conflict writing {0}: resource version is stale")]
    Conflict(String),

    /// The record is missing a metadata field required for the operation
    #[error("record is missing metadata field: {0}")]
    MissingMetadata(&'static str),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Stored record could not be interpreted
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Watch stream error
    #[error("watch error: {0}")]
    Watch(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Fault injected by a test hook
    #[error("injected fault: {0}")]
    Injected(String),
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Whether re-running the reconcile against fresh state can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StoreError::MissingMetadata(_) | StoreError::InvalidRecord(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Bound shared by every record type the gateway can store
pub trait StoredObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Identity of a record within its kind: namespace and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a stored record; `None` if it has no name
    pub fn from_object<K: Resource>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.clone()?;
        let namespace = obj
            .meta()
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        Some(Self { namespace, name })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Selector for list queries: label equality and/or owner uid
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    labels: BTreeMap<String, String>,
    owner_uid: Option<String>,
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a label to be present with the given value
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Require an owner reference to the record with this uid
    pub fn owned_by(mut self, uid: impl Into<String>) -> Self {
        self.owner_uid = Some(uid.into());
        self
    }

    /// Label selector string in Kubernetes syntax, if any labels are set
    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        Some(
            self.labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        let labels_match = self.labels.iter().all(|(k, v)| {
            meta.labels
                .as_ref()
                .and_then(|labels| labels.get(k))
                .is_some_and(|actual| actual == v)
        });
        let owner_match = match &self.owner_uid {
            Some(uid) => owner_uids(meta).any(|owner| owner == uid),
            None => true,
        };
        labels_match && owner_match
    }
}

/// A change observed on a watched kind
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    pub fn into_object(self) -> K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// Typed, watch-capable object store
///
/// Writes use optimistic concurrency: `update` and `update_status` fail with
/// [`StoreError::Conflict`] when the record's `resourceVersion` is stale.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch a record; `Ok(None)` when it does not exist
    async fn get<K: StoredObject>(&self, namespace: &str, name: &str) -> StoreResult<Option<K>>;

    /// List records ordered by name. `None` lists across all namespaces.
    async fn list<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        filter: &ListFilter,
    ) -> StoreResult<Vec<K>>;

    /// Create a record; fails with [`StoreError::AlreadyExists`] on a name clash
    async fn create<K: StoredObject>(&self, obj: &K) -> StoreResult<K>;

    /// Replace metadata and spec. The status sub-record is not written.
    async fn update<K: StoredObject>(&self, obj: &K) -> StoreResult<K>;

    /// Replace only the status sub-record
    async fn update_status<K: StoredObject>(&self, obj: &K) -> StoreResult<K>;

    /// Request deletion. Records with finalizers are marked as deleting and
    /// removed once their last finalizer is cleared. Missing records are ignored.
    async fn delete<K: StoredObject>(&self, namespace: &str, name: &str) -> StoreResult<()>;

    /// Stream of changes to records of kind `K`
    fn watch<K: StoredObject>(
        &self,
        namespace: Option<&str>,
    ) -> BoxStream<'static, StoreResult<WatchEvent<K>>>;
}

/// Create `child` with a controller owner reference to `parent`.
///
/// The child inherits the parent's namespace when it has none.
pub async fn create_owned<S, P, C>(store: &S, parent: &P, mut child: C) -> StoreResult<C>
where
    S: ObjectStore,
    P: StoredObject,
    C: StoredObject,
{
    let owner = parent
        .controller_owner_ref(&())
        .ok_or(StoreError::MissingMetadata("uid"))?;
    child
        .meta_mut()
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(owner);
    if child.meta().namespace.is_none() {
        child.meta_mut().namespace = parent.namespace();
    }
    store.create(&child).await
}

/// Add a non-controller owner reference to `parent` and write `child` back.
///
/// A no-op when `child` is already owned by `parent`. The child then survives
/// garbage collection for as long as any of its owners exists.
pub async fn add_owner<S, P, C>(store: &S, parent: &P, mut child: C) -> StoreResult<C>
where
    S: ObjectStore,
    P: StoredObject,
    C: StoredObject,
{
    let mut owner = parent
        .controller_owner_ref(&())
        .ok_or(StoreError::MissingMetadata("uid"))?;
    if owned_by(&child, &owner.uid) {
        return Ok(child);
    }
    owner.controller = Some(false);
    child
        .meta_mut()
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(owner);
    store.update(&child).await
}

/// Whether `obj` carries an owner reference to a record with `uid`
pub fn owned_by<K: Resource>(obj: &K, uid: &str) -> bool {
    owner_uids(obj.meta()).any(|owner| owner == uid)
}

fn owner_uids(meta: &ObjectMeta) -> impl Iterator<Item = &str> {
    meta.owner_references
        .iter()
        .flatten()
        .map(|owner| owner.uid.as_str())
}

pub fn has_finalizer<K: Resource>(obj: &K, token: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|t| t == token))
}

/// Whether deletion of the record has been requested
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Current spec generation, as stamped by the store
pub fn generation<K: Resource>(obj: &K) -> i64 {
    obj.meta().generation.unwrap_or(0)
}

/// Add `token` to the record's finalizers, writing only if it was missing
pub async fn ensure_finalizer<S, K>(store: &S, mut obj: K, token: &str) -> StoreResult<K>
where
    S: ObjectStore,
    K: StoredObject,
{
    if has_finalizer(&obj, token) {
        return Ok(obj);
    }
    obj.meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(token.to_string());
    store.update(&obj).await
}

/// Remove `token` from the record's finalizers.
///
/// Removing the last finalizer of a deleting record lets the store remove it.
pub async fn remove_finalizer<S, K>(store: &S, mut obj: K, token: &str) -> StoreResult<()>
where
    S: ObjectStore,
    K: StoredObject,
{
    if !has_finalizer(&obj, token) {
        return Ok(());
    }
    if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
        finalizers.retain(|t| t != token);
    }
    match store.update(&obj).await {
        Ok(_) => Ok(()),
        Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn meta_with(labels: &[(&str, &str)], owner: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some("child".to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            owner_references: owner.map(|uid| {
                vec![OwnerReference {
                    api_version: "osbapi.ism.io/v1alpha1".to_string(),
                    kind: "Broker".to_string(),
                    name: "b1".to_string(),
                    uid: uid.to_string(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::new("default", "b1").to_string(), "default/b1");
    }

    #[test]
    fn test_label_selector() {
        assert_eq!(ListFilter::new().label_selector(), None);
        let filter = ListFilter::new().label("a", "1").label("b", "2");
        assert_eq!(filter.label_selector().as_deref(), Some("a=1,b=2"));
    }

    #[test]
    fn test_filter_matches_labels_and_owner() {
        let meta = meta_with(&[("osbapi.ism.io/broker-name", "b1")], Some("uid-1"));

        assert!(ListFilter::new().matches(&meta));
        assert!(ListFilter::new()
            .label("osbapi.ism.io/broker-name", "b1")
            .matches(&meta));
        assert!(!ListFilter::new()
            .label("osbapi.ism.io/broker-name", "b2")
            .matches(&meta));
        assert!(ListFilter::new().owned_by("uid-1").matches(&meta));
        assert!(!ListFilter::new().owned_by("uid-2").matches(&meta));
    }

    #[test]
    fn test_filter_without_labels_or_owners() {
        let meta = ObjectMeta::default();
        assert!(!ListFilter::new().label("a", "1").matches(&meta));
        assert!(!ListFilter::new().owned_by("uid-1").matches(&meta));
    }
}
