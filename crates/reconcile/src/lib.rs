//! Outpost reconcile: keeps an outpost's cluster objects in line with its configuration.
//!
//! Each resource kind has a [`Reconciler`] that computes the reference object,
//! fetches the live one, compares, and converges. The [`Driver`] runs them for
//! one outpost in dependency order and collects a [`ReconcileReport`].
//!
//! Callers must not run two passes for the same outpost at the same time;
//! passes for different outposts may run concurrently against one store.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::ObjectMeta;
use outpost_core::{ConfigError, Divergence, Outpost, PodLabels};

pub mod deployment;
pub mod diff;
mod driver;
mod reconciler;
pub mod secret;
pub mod service;

pub use driver::{Driver, DriverError, Stores};
pub use outpost_core::{Outcome, ReconcileReport};
pub use reconciler::{reconcile_pass, teardown_pass, KindPass, Reconciler};

/// Failure to compute a reference object. Aborts the owning unit's pass.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("{kind}: cannot compute reference: {reason}")]
    Misconfigured { kind: &'static str, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Validated outpost plus the pod labels derived from it, shared by every reconciler of one pass.
#[derive(Debug, Clone)]
pub struct OutpostContext {
    pub outpost: Outpost,
    pub labels: PodLabels,
}

impl OutpostContext {
    pub fn new(outpost: Outpost) -> Result<Self, ConfigError> {
        outpost.validate()?;
        let labels = PodLabels::for_outpost(&outpost)?;
        Ok(Self { outpost, labels })
    }

    pub fn shared(outpost: Outpost) -> Result<Arc<Self>, ConfigError> {
        Self::new(outpost).map(Arc::new)
    }

    pub fn name(&self) -> String { self.outpost.resource_name() }

    pub fn namespace(&self) -> &str { &self.outpost.namespace }

    /// Metadata every reference object starts from.
    pub fn object_meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name()),
            namespace: Some(self.outpost.namespace.clone()),
            labels: Some(self.labels.to_map()),
            ..Default::default()
        }
    }
}

/// Reference objects for every kind, in dependency order, without touching a store.
pub fn render(outpost: Outpost) -> Result<Vec<(&'static str, serde_json::Value)>, ReconcileError> {
    let ctx = OutpostContext::new(outpost)?;
    let to_json = |kind: &'static str, v: Result<serde_json::Value, serde_json::Error>| {
        v.map(|v| (kind, v)).map_err(|e| ReconcileError::Misconfigured { kind, reason: e.to_string() })
    };
    Ok(vec![
        to_json(secret::KIND, serde_json::to_value(secret::desired(&ctx)?))?,
        to_json(deployment::KIND, serde_json::to_value(deployment::desired(&ctx)?))?,
        to_json(service::KIND, serde_json::to_value(service::desired(&ctx)?))?,
    ])
}

/// Desired labels must all be present on the live object; extra live labels are left alone.
pub(crate) fn labels_covered(live: Option<&BTreeMap<String, String>>, desired: Option<&BTreeMap<String, String>>) -> bool {
    match desired {
        None => true,
        Some(d) => {
            let empty = BTreeMap::new();
            let live = live.unwrap_or(&empty);
            d.iter().all(|(k, v)| live.get(k) == Some(v))
        }
    }
}

pub(crate) fn meta_divergence(live: &ObjectMeta, reference: &ObjectMeta) -> Divergence {
    if labels_covered(live.labels.as_ref(), reference.labels.as_ref()) {
        Divergence::None
    } else {
        Divergence::Patchable
    }
}

/// Live collection satisfies the desired one: no fewer elements, and every desired element present.
///
/// Extra live elements are tolerated so fields added by other writers are not clobbered.
pub(crate) fn covers<T>(live: &[T], desired: &[T], same: impl Fn(&T, &T) -> bool) -> bool {
    live.len() >= desired.len() && desired.iter().all(|d| live.iter().any(|l| same(d, l)))
}
