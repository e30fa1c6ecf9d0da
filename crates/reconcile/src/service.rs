//! ClusterIP service in front of the outpost pods.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use outpost_core::Divergence;
use outpost_kubehub::ObjectStore;

use crate::{covers, deployment, meta_divergence, OutpostContext, ReconcileError, Reconciler};

pub const KIND: &str = "service";

const SERVICE_TYPE: &str = "ClusterIP";
const DEFAULT_PROTOCOL: &str = "TCP";

pub fn desired(ctx: &OutpostContext) -> Result<Service, ReconcileError> {
    let ports: Vec<ServicePort> = ctx
        .outpost
        .ports
        .iter()
        .map(|p| ServicePort { name: Some(p.name.clone()), port: p.port, ..Default::default() })
        .collect();
    Ok(Service {
        metadata: ctx.object_meta(),
        spec: Some(ServiceSpec {
            ports: Some(ports),
            selector: Some(ctx.labels.to_map()),
            type_: Some(SERVICE_TYPE.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn target_port(p: &ServicePort) -> IntOrString {
    p.target_port.clone().unwrap_or(IntOrString::Int(p.port))
}

/// Equal after filling in what the API server defaults (protocol, targetPort).
fn same_port(desired: &ServicePort, live: &ServicePort) -> bool {
    desired.name == live.name
        && desired.port == live.port
        && desired.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL) == live.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL)
        && target_port(desired) == target_port(live)
}

/// Ports follow the subset policy: the live list may carry extra ports but
/// must hold every reference port. Selector and type must match exactly.
pub fn compare(current: &Service, reference: &Service) -> Divergence {
    let meta = meta_divergence(&current.metadata, &reference.metadata);
    let Some(want) = reference.spec.as_ref() else { return meta };
    let Some(live) = current.spec.as_ref() else { return Divergence::Patchable };

    let ports_ok = covers(
        live.ports.as_deref().unwrap_or_default(),
        want.ports.as_deref().unwrap_or_default(),
        same_port,
    );
    let empty = BTreeMap::new();
    let selector_ok = live.selector.as_ref().unwrap_or(&empty) == want.selector.as_ref().unwrap_or(&empty);
    let type_ok = live.type_.as_deref().unwrap_or(SERVICE_TYPE) == want.type_.as_deref().unwrap_or(SERVICE_TYPE);

    if ports_ok && selector_ok && type_ok { meta } else { Divergence::Patchable }
}

pub struct ServiceReconciler {
    ctx: Arc<OutpostContext>,
    store: Arc<dyn ObjectStore<Service>>,
}

impl ServiceReconciler {
    pub fn new(ctx: Arc<OutpostContext>, store: Arc<dyn ObjectStore<Service>>) -> Self {
        Self { ctx, store }
    }
}

impl Reconciler for ServiceReconciler {
    type Object = Service;

    fn kind(&self) -> &'static str { KIND }

    /// Selects the pods the deployment labels.
    fn depends_on(&self) -> &'static [&'static str] { &[deployment::KIND] }

    fn namespace(&self) -> &str { self.ctx.namespace() }

    fn name(&self) -> String { self.ctx.name() }

    fn store(&self) -> &dyn ObjectStore<Service> { self.store.as_ref() }

    fn get_reference(&self) -> Result<Service, ReconcileError> { desired(&self.ctx) }

    fn compare(&self, current: &Service, reference: &Service) -> Divergence { compare(current, reference) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core::Outpost;
    use uuid::Uuid;

    fn ctx(ports: &[(&str, i32)]) -> OutpostContext {
        let mut o = Outpost::new(Uuid::from_u128(3), "proxy", "auth", "img:1");
        o.token = "tok".into();
        for (n, p) in ports {
            o = o.with_port(*n, *p);
        }
        OutpostContext::new(o).unwrap()
    }

    fn with_ports(mut svc: Service, ports: &[(&str, i32)]) -> Service {
        svc.spec.as_mut().unwrap().ports = Some(
            ports.iter().map(|(n, p)| ServicePort { name: Some(n.to_string()), port: *p, ..Default::default() }).collect(),
        );
        svc
    }

    #[test]
    fn reference_selects_pod_labels() {
        let c = ctx(&[("http", 80)]);
        let s = desired(&c).unwrap();
        let spec = s.spec.unwrap();
        assert_eq!(spec.selector.as_ref(), Some(c.labels.as_map()));
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.ports.unwrap()[0].port, 80);
    }

    #[test]
    fn missing_port_diverges() {
        let reference = desired(&ctx(&[("http", 80)])).unwrap();
        let live = with_ports(reference.clone(), &[]);
        assert_eq!(compare(&live, &reference), Divergence::Patchable);
    }

    #[test]
    fn fewer_live_ports_diverge() {
        let reference = desired(&ctx(&[("http", 80), ("https", 443)])).unwrap();
        let live = with_ports(reference.clone(), &[("http", 80)]);
        assert_eq!(compare(&live, &reference), Divergence::Patchable);
    }

    #[test]
    fn extra_live_port_is_tolerated() {
        let reference = desired(&ctx(&[("http", 80)])).unwrap();
        let live = with_ports(reference.clone(), &[("http", 80), ("metrics", 9090)]);
        assert_eq!(compare(&live, &reference), Divergence::None);
    }

    #[test]
    fn server_defaults_do_not_diverge() {
        let reference = desired(&ctx(&[("http", 80)])).unwrap();
        let mut live = reference.clone();
        let spec = live.spec.as_mut().unwrap();
        spec.cluster_ip = Some("10.0.0.12".into());
        let port = &mut spec.ports.as_mut().unwrap()[0];
        port.protocol = Some("TCP".into());
        port.target_port = Some(IntOrString::Int(80));
        assert_eq!(compare(&live, &reference), Divergence::None);

        let mut live = reference.clone();
        live.spec.as_mut().unwrap().type_ = None;
        assert_eq!(compare(&live, &reference), Divergence::None);
    }

    #[test]
    fn selector_or_type_change_diverges() {
        let reference = desired(&ctx(&[("http", 80)])).unwrap();
        let mut live = reference.clone();
        live.spec.as_mut().unwrap().selector = Some(BTreeMap::from([("app".to_string(), "other".to_string())]));
        assert_eq!(compare(&live, &reference), Divergence::Patchable);

        let mut live = reference.clone();
        live.spec.as_mut().unwrap().type_ = Some("NodePort".into());
        assert_eq!(compare(&live, &reference), Divergence::Patchable);
    }
}
