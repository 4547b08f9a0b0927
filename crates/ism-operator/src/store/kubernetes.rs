//! Kubernetes backend for the object store gateway

use super::{ListFilter, ObjectStore, StoreError, StoreResult, StoredObject, WatchEvent};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use std::collections::HashSet;
use tracing::debug;

/// Object store backed by the Kubernetes API server.
///
/// Cascade deletion and finalizer handling are performed by the API server
/// and its garbage collector.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoredObject>(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

fn describe<K: StoredObject>(namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", K::kind(&()), namespace, name)
}

/// Map API errors onto the gateway's error kinds.
///
/// A 409 means "already exists" on create and "stale resource version" on
/// replace, so the caller says which one it was doing.
fn map_error(e: kube::Error, what: String, creating: bool) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what),
        kube::Error::Api(ae) if ae.code == 409 && creating => StoreError::AlreadyExists(what),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(what),
        e => StoreError::Kube(e),
    }
}

fn record_name<K: StoredObject>(obj: &K) -> StoreResult<(String, String)> {
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or(StoreError::MissingMetadata("name"))?;
    let namespace = obj
        .meta()
        .namespace
        .clone()
        .ok_or(StoreError::MissingMetadata("namespace"))?;
    Ok((namespace, name))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoredObject>(&self, namespace: &str, name: &str) -> StoreResult<Option<K>> {
        self.api::<K>(Some(namespace))
            .get_opt(name)
            .await
            .map_err(|e| map_error(e, describe::<K>(namespace, name), false))
    }

    async fn list<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        filter: &ListFilter,
    ) -> StoreResult<Vec<K>> {
        let mut params = ListParams::default();
        if let Some(selector) = filter.label_selector() {
            params = params.labels(&selector);
        }

        let list = self.api::<K>(namespace).list(&params).await?;
        let mut items: Vec<K> = list
            .items
            .into_iter()
            .filter(|obj| filter.matches(obj.meta()))
            .collect();
        items.sort_by_key(|obj| obj.name_any());
        Ok(items)
    }

    async fn create<K: StoredObject>(&self, obj: &K) -> StoreResult<K> {
        let (namespace, name) = record_name(obj)?;
        debug!(kind = %K::kind(&()), namespace = %namespace, name = %name, "Creating record");

        self.api::<K>(Some(&namespace))
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_error(e, describe::<K>(&namespace, &name), true))
    }

    async fn update<K: StoredObject>(&self, obj: &K) -> StoreResult<K> {
        let (namespace, name) = record_name(obj)?;
        debug!(kind = %K::kind(&()), namespace = %namespace, name = %name, "Updating record");

        self.api::<K>(Some(&namespace))
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_error(e, describe::<K>(&namespace, &name), false))
    }

    async fn update_status<K: StoredObject>(&self, obj: &K) -> StoreResult<K> {
        let (namespace, name) = record_name(obj)?;
        debug!(kind = %K::kind(&()), namespace = %namespace, name = %name, "Updating record status");

        let body = serde_json::to_vec(obj)?;
        self.api::<K>(Some(&namespace))
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| map_error(e, describe::<K>(&namespace, &name), false))
    }

    async fn delete<K: StoredObject>(&self, namespace: &str, name: &str) -> StoreResult<()> {
        debug!(kind = %K::kind(&()), namespace = %namespace, name = %name, "Deleting record");

        match self
            .api::<K>(Some(namespace))
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(StoreError::Kube(e)),
        }
    }

    fn watch<K: StoredObject>(
        &self,
        namespace: Option<&str>,
    ) -> BoxStream<'static, StoreResult<WatchEvent<K>>> {
        // The API server reports creations and updates alike as "apply";
        // uids seen so far tell the two apart.
        let mut seen: HashSet<String> = HashSet::new();

        watcher(self.api::<K>(namespace), watcher::Config::default())
            .default_backoff()
            .filter_map(move |event| {
                let mapped = match event {
                    Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                        let uid = obj.uid().unwrap_or_default();
                        if seen.insert(uid) {
                            Some(Ok(WatchEvent::Added(obj)))
                        } else {
                            Some(Ok(WatchEvent::Modified(obj)))
                        }
                    }
                    Ok(watcher::Event::Delete(obj)) => {
                        if let Some(uid) = obj.uid() {
                            seen.remove(&uid);
                        }
                        Some(Ok(WatchEvent::Deleted(obj)))
                    }
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(StoreError::Watch(e.to_string()))),
                };
                futures::future::ready(mapped)
            })
            .boxed()
    }
}
