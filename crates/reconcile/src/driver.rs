use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use metrics::counter;
use outpost_core::{ConfigError, ReconcileReport};
use outpost_kubehub::{KubeStore, MemoryStore, ObjectStore};
use tracing::{error, info, warn};

use crate::deployment::DeploymentReconciler;
use crate::secret::SecretReconciler;
use crate::service::ServiceReconciler;
use crate::{KindPass, OutpostContext, ReconcileError};

/// Store handles for each kind the outpost driver manages.
#[derive(Clone)]
pub struct Stores {
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    pub deployments: Arc<dyn ObjectStore<Deployment>>,
    pub services: Arc<dyn ObjectStore<Service>>,
}

impl Stores {
    /// One kube-backed store serving every kind.
    pub fn kube(store: KubeStore) -> Self {
        Self {
            secrets: Arc::new(store.clone()),
            deployments: Arc::new(store.clone()),
            services: Arc::new(store),
        }
    }

    /// Fresh in-process stores, for offline runs and tests.
    pub fn memory() -> Self {
        Self {
            secrets: Arc::new(MemoryStore::<Secret>::new()),
            deployments: Arc::new(MemoryStore::<Deployment>::new()),
            services: Arc::new(MemoryStore::<Service>::new()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{unit}: {kind} depends on {missing}, which is not registered before it")]
    Ordering { unit: String, kind: &'static str, missing: &'static str },
    #[error("{unit}: {kind} registered twice")]
    Duplicate { unit: String, kind: &'static str },
    #[error("{unit}: pass aborted at {kind}: {source}")]
    Aborted {
        unit: String,
        kind: &'static str,
        #[source]
        source: ReconcileError,
        /// Outcomes of the kinds that ran before the abort.
        partial: ReconcileReport,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Runs the reconcilers of one owning unit in dependency order.
///
/// The driver never retries. It is meant to be invoked again by whatever
/// schedules it; a failed kind converges on a later pass.
pub struct Driver {
    unit: String,
    passes: Vec<Box<dyn KindPass>>,
}

impl Driver {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into(), passes: Vec::new() }
    }

    /// Secret, deployment and service for one outpost, sharing one context and its pod labels.
    pub fn for_outpost(ctx: Arc<OutpostContext>, stores: &Stores) -> Result<Self, DriverError> {
        let mut d = Driver::new(ctx.outpost.unit_key());
        d.register(SecretReconciler::new(Arc::clone(&ctx), Arc::clone(&stores.secrets)))?;
        d.register(DeploymentReconciler::new(Arc::clone(&ctx), Arc::clone(&stores.deployments)))?;
        d.register(ServiceReconciler::new(ctx, Arc::clone(&stores.services)))?;
        Ok(d)
    }

    /// Append a reconciler. Everything it depends on must already be registered.
    pub fn register<P>(&mut self, pass: P) -> Result<(), DriverError>
    where
        P: KindPass + 'static,
    {
        let kind = pass.kind();
        if self.passes.iter().any(|p| p.kind() == kind) {
            return Err(DriverError::Duplicate { unit: self.unit.clone(), kind });
        }
        if let Some(missing) = pass.depends_on().iter().copied().find(|dep| !self.passes.iter().any(|p| p.kind() == *dep)) {
            return Err(DriverError::Ordering { unit: self.unit.clone(), kind, missing });
        }
        self.passes.push(Box::new(pass));
        Ok(())
    }

    pub fn unit(&self) -> &str { &self.unit }

    pub fn kinds(&self) -> Vec<&'static str> { self.passes.iter().map(|p| p.kind()).collect() }

    /// Reconcile every kind in order.
    ///
    /// A kind whose store calls fail is reported as failed and the remaining kinds
    /// still run. A kind that cannot compute its reference aborts the pass, since
    /// later kinds may depend on it.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, DriverError> {
        let mut report = ReconcileReport::new(self.unit.clone());
        for pass in &self.passes {
            match pass.reconcile().await {
                Ok(outcome) => report.push(pass.kind(), outcome),
                Err(source) => {
                    counter!("driver_aborts_total", 1u64);
                    error!(unit = %self.unit, kind = pass.kind(), error = %source, "reconcile aborted");
                    return Err(DriverError::Aborted { unit: self.unit.clone(), kind: pass.kind(), source, partial: report });
                }
            }
        }
        let failed = report.failures().count();
        if failed > 0 {
            warn!(unit = %self.unit, failed, total = report.outcomes.len(), "reconcile finished with failures");
        } else {
            info!(unit = %self.unit, total = report.outcomes.len(), "reconcile finished");
        }
        Ok(report)
    }

    /// Delete every kind in reverse order. Already absent objects count as success.
    pub async fn teardown_all(&self) -> ReconcileReport {
        let mut report = ReconcileReport::new(self.unit.clone());
        for pass in self.passes.iter().rev() {
            let outcome = pass.teardown().await;
            report.push(pass.kind(), outcome);
        }
        info!(unit = %self.unit, failed = report.failures().count(), "teardown finished");
        report
    }

    /// Reference objects for every kind, in order, without I/O.
    pub fn render_all(&self) -> Result<Vec<(&'static str, serde_json::Value)>, ReconcileError> {
        self.passes.iter().map(|p| p.render().map(|v| (p.kind(), v))).collect()
    }
}
