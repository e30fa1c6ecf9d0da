use std::fmt::Debug;
use std::time::Instant;

use async_trait::async_trait;
use kube::Resource;
use metrics::{counter, histogram};
use outpost_core::{Divergence, Outcome};
use outpost_kubehub::{ObjectStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{diff, ReconcileError};

/// Convergence contract for one resource kind.
///
/// Implementors provide the reference computation and the comparison; the
/// store-facing operations default to the reconciler's [`ObjectStore`].
#[async_trait]
pub trait Reconciler: Send + Sync {
    type Object: Resource<DynamicType = ()> + Clone + Serialize + Debug + Send + Sync + 'static;

    /// Short kind label used in reports, logs and metrics.
    fn kind(&self) -> &'static str;

    /// Kinds whose reference output this one reads. They must run earlier.
    fn depends_on(&self) -> &'static [&'static str] { &[] }

    fn namespace(&self) -> &str;

    /// Stable, collision-free object name for the owning unit.
    fn name(&self) -> String;

    fn store(&self) -> &dyn ObjectStore<Self::Object>;

    /// Desired object. Pure: no I/O, same inputs give the same value.
    fn get_reference(&self) -> Result<Self::Object, ReconcileError>;

    /// Compare only owned fields; store-assigned fields are ignored.
    fn compare(&self, current: &Self::Object, reference: &Self::Object) -> Divergence;

    async fn retrieve(&self) -> Result<Self::Object, StoreError> {
        self.store().retrieve(self.namespace(), &self.name()).await
    }

    async fn create(&self, reference: &Self::Object) -> Result<Self::Object, StoreError> {
        self.store().create(self.namespace(), reference).await
    }

    async fn update(&self, current: &Self::Object, reference: &Self::Object) -> Result<Self::Object, StoreError> {
        let name = current.meta().name.clone().unwrap_or_else(|| self.name());
        self.store().update(self.namespace(), &name, reference).await
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store().delete(self.namespace(), name).await
    }
}

/// One reconciliation pass for one kind.
///
/// Store failures are reported as [`Outcome::Failed`] and never retried here.
/// `Err` is returned only when no reference can be computed.
pub async fn reconcile_pass<R>(r: &R) -> Result<Outcome, ReconcileError>
where
    R: Reconciler + ?Sized,
{
    let t0 = Instant::now();
    let kind = Reconciler::kind(r);
    let name = r.name();
    let reference = r.get_reference()?;

    let outcome = match r.retrieve().await {
        Err(e) if e.is_not_found() => match r.create(&reference).await {
            Ok(_) => Outcome::Created,
            Err(e) => Outcome::Failed(e.to_string()),
        },
        Err(e) => Outcome::Failed(e.to_string()),
        Ok(current) => match r.compare(&current, &reference) {
            Divergence::None => Outcome::Unchanged,
            Divergence::Patchable => {
                if let Some(summary) = diff::summarize(&reference, &current) {
                    debug!(kind, name = %name, diff = %summary, "live object diverges");
                }
                match r.update(&current, &reference).await {
                    Ok(_) => Outcome::Updated,
                    Err(e) => Outcome::Failed(e.to_string()),
                }
            }
            Divergence::Structural => {
                info!(kind, name = %name, "immutable field changed; recreating");
                recreate(r, &current, &reference).await
            }
        },
    };

    let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
    counter!("reconcile_outcome_total", 1u64, "kind" => kind, "outcome" => outcome.label());
    histogram!("reconcile_pass_ms", took_ms, "kind" => kind);
    match &outcome {
        Outcome::Failed(reason) => warn!(kind, name = %name, reason = %reason, "reconcile pass failed"),
        o => info!(kind, name = %name, outcome = %o, took_ms, "reconcile pass done"),
    }
    Ok(outcome)
}

async fn recreate<R>(r: &R, current: &R::Object, reference: &R::Object) -> Outcome
where
    R: Reconciler + ?Sized,
{
    let name = current.meta().name.clone().unwrap_or_else(|| r.name());
    match r.delete(&name).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Outcome::Failed(e.to_string()),
    }
    match r.create(reference).await {
        Ok(_) => Outcome::Recreated,
        Err(e) => Outcome::Failed(e.to_string()),
    }
}

/// Remove this kind's object. An already absent object is a success.
pub async fn teardown_pass<R>(r: &R) -> Outcome
where
    R: Reconciler + ?Sized,
{
    let kind = Reconciler::kind(r);
    let name = r.name();
    let outcome = match r.delete(&name).await {
        Ok(()) => Outcome::Deleted,
        Err(e) if e.is_not_found() => Outcome::Absent,
        Err(e) => Outcome::Failed(e.to_string()),
    };
    counter!("reconcile_outcome_total", 1u64, "kind" => kind, "outcome" => outcome.label());
    match &outcome {
        Outcome::Failed(reason) => warn!(kind, name = %name, reason = %reason, "teardown failed"),
        o => info!(kind, name = %name, outcome = %o, "teardown done"),
    }
    outcome
}

/// Object-safe view of a [`Reconciler`], so the driver can hold reconcilers of different kinds.
#[async_trait]
pub trait KindPass: Send + Sync {
    fn kind(&self) -> &'static str;
    fn depends_on(&self) -> &'static [&'static str];
    async fn reconcile(&self) -> Result<Outcome, ReconcileError>;
    async fn teardown(&self) -> Outcome;
    /// Reference object as JSON, without I/O.
    fn render(&self) -> Result<serde_json::Value, ReconcileError>;
}

#[async_trait]
impl<R> KindPass for R
where
    R: Reconciler,
{
    fn kind(&self) -> &'static str { Reconciler::kind(self) }

    fn depends_on(&self) -> &'static [&'static str] { Reconciler::depends_on(self) }

    async fn reconcile(&self) -> Result<Outcome, ReconcileError> { reconcile_pass(self).await }

    async fn teardown(&self) -> Outcome { teardown_pass(self).await }

    fn render(&self) -> Result<serde_json::Value, ReconcileError> {
        let reference = self.get_reference()?;
        serde_json::to_value(&reference)
            .map_err(|e| ReconcileError::Misconfigured { kind: Reconciler::kind(self), reason: e.to_string() })
    }
}
