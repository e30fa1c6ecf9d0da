use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use kube::Resource;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{object_key, ObjectStore, StoreError, StoreOp};

/// In-process [`ObjectStore`] with the same failure contract as the API server.
///
/// Assigns `uid` and a monotonically increasing `resourceVersion`, counts
/// mutating calls, and can be told to fail the next call of a given kind.
/// `update` replaces the stored object wholesale (keeping uid, bumping the version).
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    injected: Mutex<Vec<(StoreOp, StoreError)>>,
    calls: Mutex<Vec<StoreOp>>,
    next_rv: AtomicU64,
    mutations: AtomicUsize,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            injected: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            next_rv: AtomicU64::new(1),
            mutations: AtomicUsize::new(0),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self { Self::default() }

    /// Insert an object as if another writer had created it. Not counted as a mutation.
    pub async fn seed(&self, namespace: &str, mut object: K) -> K {
        let name = object.meta().name.clone().unwrap_or_default();
        self.stamp(namespace, &mut object, None);
        self.objects.lock().await.insert((namespace.to_string(), name), object.clone());
        object
    }

    /// Peek at the stored object without recording a call.
    pub async fn get(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects.lock().await.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub async fn len(&self) -> usize { self.objects.lock().await.len() }

    /// Make the next `op` call fail with `err`. Injections are consumed in order.
    pub async fn inject(&self, op: StoreOp, err: StoreError) {
        self.injected.lock().await.push((op, err));
    }

    /// Number of create/update/delete calls attempted so far.
    pub fn mutations(&self) -> usize { self.mutations.load(Ordering::SeqCst) }

    /// Every call attempted so far, in order.
    pub async fn calls(&self) -> Vec<StoreOp> { self.calls.lock().await.clone() }

    fn stamp(&self, namespace: &str, object: &mut K, uid: Option<String>) {
        let rv = self.next_rv.fetch_add(1, Ordering::SeqCst);
        let meta = object.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.resource_version = Some(rv.to_string());
        meta.uid = Some(uid.unwrap_or_else(|| Uuid::new_v4().to_string()));
    }

    async fn begin(&self, op: StoreOp) -> Result<(), StoreError> {
        self.calls.lock().await.push(op);
        if op.is_mutating() {
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
        let mut injected = self.injected.lock().await;
        match injected.iter().position(|(o, _)| *o == op) {
            Some(idx) => Err(injected.remove(idx).1),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn retrieve(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.begin(StoreOp::Retrieve).await?;
        self.get(namespace, name)
            .await
            .ok_or_else(|| StoreError::NotFound { key: object_key::<K>(namespace, name) })
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, StoreError> {
        self.begin(StoreOp::Create).await?;
        let name = object.meta().name.clone().unwrap_or_default();
        let key = object_key::<K>(namespace, &name);
        if name.is_empty() {
            return Err(StoreError::Transport { op: StoreOp::Create, key, message: "metadata.name is required".into() });
        }
        let mut objects = self.objects.lock().await;
        let slot = (namespace.to_string(), name);
        if objects.contains_key(&slot) {
            return Err(StoreError::AlreadyExists { key });
        }
        let mut stored = object.clone();
        self.stamp(namespace, &mut stored, None);
        objects.insert(slot, stored.clone());
        debug!(key = %key, "memory store: created");
        Ok(stored)
    }

    async fn update(&self, namespace: &str, name: &str, object: &K) -> Result<K, StoreError> {
        self.begin(StoreOp::Update).await?;
        let key = object_key::<K>(namespace, name);
        let mut objects = self.objects.lock().await;
        let slot = (namespace.to_string(), name.to_string());
        let uid = match objects.get(&slot) {
            Some(live) => live.meta().uid.clone(),
            None => return Err(StoreError::NotFound { key }),
        };
        let mut stored = object.clone();
        stored.meta_mut().name = Some(name.to_string());
        self.stamp(namespace, &mut stored, uid);
        objects.insert(slot, stored.clone());
        debug!(key = %key, "memory store: updated");
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.begin(StoreOp::Delete).await?;
        let key = object_key::<K>(namespace, name);
        match self.objects.lock().await.remove(&(namespace.to_string(), name.to_string())) {
            Some(_) => {
                debug!(key = %key, "memory store: deleted");
                Ok(())
            }
            None => Err(StoreError::NotFound { key }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(name: &str, v: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            data: Some([("k".to_string(), v.to_string())].into_iter().collect()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_twice_surfaces_already_exists() {
        let store = MemoryStore::<ConfigMap>::new();
        let first = store.create("ns", &cm("a", "1")).await.unwrap();
        assert!(first.metadata.uid.is_some());
        assert_eq!(first.metadata.namespace.as_deref(), Some("ns"));
        let err = store.create("ns", &cm("a", "2")).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists { key: "ConfigMap/ns/a".into() });
        // the first write is intact
        let live = store.get("ns", "a").await.unwrap();
        assert_eq!(live.data.unwrap().get("k").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn update_keeps_uid_and_bumps_version() {
        let store = MemoryStore::<ConfigMap>::new();
        let created = store.create("ns", &cm("a", "1")).await.unwrap();
        let updated = store.update("ns", "a", &cm("a", "2")).await.unwrap();
        assert_eq!(created.metadata.uid, updated.metadata.uid);
        let rv = |o: &ConfigMap| o.metadata.resource_version.clone().unwrap().parse::<u64>().unwrap();
        assert!(rv(&updated) > rv(&created));
        assert!(store.update("ns", "missing", &cm("missing", "x")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::<ConfigMap>::new();
        assert!(store.delete("ns", "a").await.unwrap_err().is_not_found());
        store.seed("ns", cm("a", "1")).await;
        store.delete("ns", "a").await.unwrap();
        assert_eq!(store.len().await, 0);
        assert_eq!(store.mutations(), 2);
    }

    #[tokio::test]
    async fn injected_failure_is_consumed_once() {
        let store = MemoryStore::<ConfigMap>::new();
        let boom = StoreError::Transport { op: StoreOp::Retrieve, key: "ConfigMap/ns/a".into(), message: "connection reset".into() };
        store.inject(StoreOp::Retrieve, boom.clone()).await;
        assert_eq!(store.retrieve("ns", "a").await.unwrap_err(), boom);
        assert!(store.retrieve("ns", "a").await.unwrap_err().is_not_found());
        assert_eq!(store.calls().await, vec![StoreOp::Retrieve, StoreOp::Retrieve]);
        assert_eq!(store.mutations(), 0);
    }
}
