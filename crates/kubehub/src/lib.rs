//! Outpost kubehub: the object store client the reconcilers talk to.
//!
//! [`ObjectStore`] is the capability set every reconciler needs (get, create,
//! apply, delete), namespace-scoped. [`KubeStore`] backs it with a kube-rs
//! client; [`MemoryStore`] keeps objects in process for tests and offline runs.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

mod client;
mod memory;

pub use client::{classify, KubeStore};
pub use memory::MemoryStore;

/// Namespace-scoped store operations for one object type `K`.
///
/// Implementations must be safe for concurrent use: several owning units may
/// reconcile against the same store at once.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Fetch by name. `StoreError::NotFound` when absent.
    async fn retrieve(&self, namespace: &str, name: &str) -> Result<K, StoreError>;
    /// Create; `StoreError::AlreadyExists` if the name is taken.
    async fn create(&self, namespace: &str, object: &K) -> Result<K, StoreError>;
    /// Bring the named object to `object`'s owned fields; `StoreError::Conflict` on a competing writer.
    async fn update(&self, namespace: &str, name: &str, object: &K) -> Result<K, StoreError>;
    /// Delete by name. `StoreError::NotFound` when already gone.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Retrieve,
    Create,
    Update,
    Delete,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::Retrieve => "retrieve",
            StoreOp::Create => "create",
            StoreOp::Update => "update",
            StoreOp::Delete => "delete",
        }
    }

    pub fn is_mutating(&self) -> bool { !matches!(self, StoreOp::Retrieve) }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Store failures. `key` is `Kind/namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{key} not found")]
    NotFound { key: String },
    #[error("{key} already exists")]
    AlreadyExists { key: String },
    #[error("conflict on {key}: {message}")]
    Conflict { key: String, message: String },
    #[error("{op} {key} timed out after {after:?}")]
    Timeout { op: StoreOp, key: String, after: Duration },
    #[error("{op} {key}: {message}")]
    Transport { op: StoreOp, key: String, message: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound { .. }) }

    /// Stable short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::AlreadyExists { .. } => "already_exists",
            StoreError::Conflict { .. } => "conflict",
            StoreError::Timeout { .. } => "timeout",
            StoreError::Transport { .. } => "transport",
        }
    }
}

/// Store tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Upper bound for every single API call.
    pub request_timeout: Duration,
    /// Field manager used for server-side apply.
    pub field_manager: String,
    /// Take ownership of fields held by other managers instead of failing with a conflict.
    pub force_apply: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(10), field_manager: "outpostctl".to_string(), force_apply: false }
    }
}

impl StoreConfig {
    /// Defaults overridden by `OUTPOST_REQUEST_TIMEOUT_SECS`, `OUTPOST_FIELD_MANAGER`, `OUTPOST_FORCE_APPLY`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let request_timeout = std::env::var("OUTPOST_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(d.request_timeout);
        let field_manager = std::env::var("OUTPOST_FIELD_MANAGER")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or(d.field_manager);
        let force_apply = std::env::var("OUTPOST_FORCE_APPLY")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(d.force_apply);
        Self { request_timeout, field_manager, force_apply }
    }
}

pub(crate) fn object_key<K: kube::Resource<DynamicType = ()>>(namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", K::kind(&()), namespace, name)
}

pub(crate) fn record_call(op: StoreOp, result: &'static str) {
    metrics::counter!("store_calls_total", 1u64, "op" => op.as_str(), "result" => result);
}
