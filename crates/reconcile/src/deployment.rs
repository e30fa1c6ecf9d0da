//! Deployment running the outpost container.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use outpost_core::Divergence;
use outpost_kubehub::ObjectStore;

use crate::{covers, labels_covered, meta_divergence, secret, OutpostContext, ReconcileError, Reconciler};

pub const KIND: &str = "deployment";

pub const ENV_HOST: &str = "OUTPOST_HOST";
pub const ENV_INSECURE: &str = "OUTPOST_INSECURE";
pub const ENV_TOKEN: &str = "OUTPOST_TOKEN";

const DEFAULT_PROTOCOL: &str = "TCP";

fn secret_env(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret_name.to_string()),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn desired(ctx: &OutpostContext) -> Result<Deployment, ReconcileError> {
    let o = &ctx.outpost;
    let name = ctx.name();
    let pod_labels = ctx.labels.to_map();

    let ports: Vec<ContainerPort> = o
        .ports
        .iter()
        .map(|p| ContainerPort {
            name: Some(p.name.clone()),
            container_port: p.port,
            protocol: Some(DEFAULT_PROTOCOL.to_string()),
            ..Default::default()
        })
        .collect();

    let mut env: Vec<EnvVar> = o
        .env
        .iter()
        .filter(|(k, _)| ![ENV_HOST, ENV_INSECURE, ENV_TOKEN].contains(&k.as_str()))
        .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() })
        .collect();
    // the secret shares the outpost's resource name
    env.push(secret_env(ENV_HOST, &name, secret::KEY_HOST));
    env.push(secret_env(ENV_INSECURE, &name, secret::KEY_INSECURE));
    env.push(secret_env(ENV_TOKEN, &name, secret::KEY_TOKEN));

    let container = Container {
        name: o.outpost_type.clone(),
        image: Some(o.image.clone()),
        ports: if ports.is_empty() { None } else { Some(ports) },
        env: Some(env),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ctx.object_meta(),
        spec: Some(DeploymentSpec {
            replicas: Some(o.replicas),
            selector: LabelSelector { match_labels: Some(pod_labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(pod_labels), ..Default::default() }),
                spec: Some(PodSpec { containers: vec![container], ..Default::default() }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn same_container_port(desired: &ContainerPort, live: &ContainerPort) -> bool {
    desired.name == live.name
        && desired.container_port == live.container_port
        && desired.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL) == live.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL)
}

/// The API server omits an empty `value`, so empty and absent are the same.
fn same_env(desired: &EnvVar, live: &EnvVar) -> bool {
    desired.name == live.name
        && desired.value.as_deref().unwrap_or_default() == live.value.as_deref().unwrap_or_default()
        && desired.value_from == live.value_from
}

fn container_divergence(live: Option<&Container>, desired: &Container) -> Divergence {
    let Some(live) = live else { return Divergence::Patchable };
    if live.image != desired.image {
        return Divergence::Patchable;
    }
    let ports_ok = covers(
        live.ports.as_deref().unwrap_or_default(),
        desired.ports.as_deref().unwrap_or_default(),
        same_container_port,
    );
    let live_env = live.env.as_deref().unwrap_or_default();
    let env_ok = desired.env.as_deref().unwrap_or_default().iter().all(|e| live_env.iter().any(|l| same_env(e, l)));
    if ports_ok && env_ok { Divergence::None } else { Divergence::Patchable }
}

/// The selector is immutable; everything else we own is patchable.
pub fn compare(current: &Deployment, reference: &Deployment) -> Divergence {
    let meta = meta_divergence(&current.metadata, &reference.metadata);
    let (Some(live), Some(want)) = (current.spec.as_ref(), reference.spec.as_ref()) else {
        return if reference.spec.is_some() { Divergence::Patchable } else { meta };
    };
    if live.selector.match_labels != want.selector.match_labels {
        return Divergence::Structural;
    }
    if live.replicas.unwrap_or(1) != want.replicas.unwrap_or(1) {
        return Divergence::Patchable;
    }
    let live_tpl_labels = live.template.metadata.as_ref().and_then(|m| m.labels.as_ref());
    let want_tpl_labels = want.template.metadata.as_ref().and_then(|m| m.labels.as_ref());
    if !labels_covered(live_tpl_labels, want_tpl_labels) {
        return Divergence::Patchable;
    }
    let live_containers = live.template.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
    let want_containers = want.template.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
    want_containers
        .iter()
        .map(|w| container_divergence(live_containers.iter().find(|c| c.name == w.name), w))
        .fold(meta, Divergence::max)
}

pub struct DeploymentReconciler {
    ctx: Arc<OutpostContext>,
    store: Arc<dyn ObjectStore<Deployment>>,
}

impl DeploymentReconciler {
    pub fn new(ctx: Arc<OutpostContext>, store: Arc<dyn ObjectStore<Deployment>>) -> Self {
        Self { ctx, store }
    }
}

impl Reconciler for DeploymentReconciler {
    type Object = Deployment;

    fn kind(&self) -> &'static str { KIND }

    fn depends_on(&self) -> &'static [&'static str] { &[secret::KIND] }

    fn namespace(&self) -> &str { self.ctx.namespace() }

    fn name(&self) -> String { self.ctx.name() }

    fn store(&self) -> &dyn ObjectStore<Deployment> { self.store.as_ref() }

    fn get_reference(&self) -> Result<Deployment, ReconcileError> { desired(&self.ctx) }

    fn compare(&self, current: &Deployment, reference: &Deployment) -> Divergence { compare(current, reference) }
}
