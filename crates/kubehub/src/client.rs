use std::fmt::Debug;
use std::future::Future;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::{object_key, record_call, ObjectStore, StoreConfig, StoreError, StoreOp};

/// [`ObjectStore`] over the Kubernetes API.
///
/// Cheap to clone; one instance can serve every resource kind and every owning unit.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    cfg: StoreConfig,
}

impl KubeStore {
    pub fn new(client: Client, cfg: StoreConfig) -> Self {
        Self { client, cfg }
    }

    /// Client from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default(cfg: StoreConfig) -> Result<Self, kube::Error> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, cfg))
    }

    pub fn config(&self) -> &StoreConfig { &self.cfg }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Run one API call under the configured timeout and classify its failure.
    async fn bounded<T, F>(&self, op: StoreOp, key: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        let res = match tokio::time::timeout(self.cfg.request_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(classify(op, key, e)),
            Err(_) => Err(StoreError::Timeout { op, key: key.to_string(), after: self.cfg.request_timeout }),
        };
        match &res {
            Ok(_) => {
                debug!(op = %op, key = %key, "store call ok");
                record_call(op, "ok");
            }
            Err(e) if e.is_not_found() => {
                debug!(op = %op, key = %key, "store call: not found");
                record_call(op, e.label());
            }
            Err(e) => {
                warn!(op = %op, key = %key, error = %e, "store call failed");
                record_call(op, e.label());
            }
        }
        res
    }
}

/// Map a kube error onto the store taxonomy for the operation that produced it.
pub fn classify(op: StoreOp, key: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound { key: key.to_string() },
        kube::Error::Api(ae) if ae.code == 409 && (ae.reason == "AlreadyExists" || op == StoreOp::Create) => {
            StoreError::AlreadyExists { key: key.to_string() }
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict { key: key.to_string(), message: ae.message },
        other => StoreError::Transport { op, key: key.to_string(), message: other.to_string() },
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn retrieve(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        let api: Api<K> = self.api(namespace);
        let key = object_key::<K>(namespace, name);
        self.bounded(StoreOp::Retrieve, &key, api.get(name)).await
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, StoreError> {
        let api: Api<K> = self.api(namespace);
        let name = object.meta().name.clone().unwrap_or_default();
        let key = object_key::<K>(namespace, &name);
        let pp = PostParams { field_manager: Some(self.cfg.field_manager.clone()), ..Default::default() };
        self.bounded(StoreOp::Create, &key, api.create(&pp, object)).await
    }

    async fn update(&self, namespace: &str, name: &str, object: &K) -> Result<K, StoreError> {
        let api: Api<K> = self.api(namespace);
        let key = object_key::<K>(namespace, name);
        let mut pp = PatchParams::apply(&self.cfg.field_manager);
        if self.cfg.force_apply {
            pp = pp.force();
        }
        self.bounded(StoreOp::Update, &key, api.patch(name, &pp, &Patch::Apply(object))).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api: Api<K> = self.api(namespace);
        let key = object_key::<K>(namespace, name);
        self.bounded(StoreOp::Delete, &key, api.delete(name, &DeleteParams::background()))
            .await
            .map(|_| ())
    }
}
