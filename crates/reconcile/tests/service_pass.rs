#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServicePort};
use outpost_core::{Outcome, Outpost};
use outpost_kubehub::{MemoryStore, StoreError, StoreOp};
use outpost_reconcile::service::{self, ServiceReconciler};
use outpost_reconcile::{reconcile_pass, OutpostContext, Reconciler};
use uuid::Uuid;

fn ctx(ports: &[(&str, i32)]) -> Arc<OutpostContext> {
    let mut o = Outpost::new(Uuid::from_u128(0xabc), "ldap proxy", "auth", "ghcr.io/example/ldap:2");
    o.token = "tok".into();
    for (n, p) in ports {
        o = o.with_port(*n, *p);
    }
    OutpostContext::shared(o).unwrap()
}

fn with_ports(mut svc: Service, ports: &[(&str, i32)]) -> Service {
    svc.spec.as_mut().unwrap().ports = Some(
        ports.iter().map(|(n, p)| ServicePort { name: Some(n.to_string()), port: *p, ..Default::default() }).collect(),
    );
    svc
}

fn ports_of(svc: &Service) -> Vec<(String, i32)> {
    svc.spec.as_ref().unwrap().ports.as_ref().unwrap().iter().map(|p| (p.name.clone().unwrap_or_default(), p.port)).collect()
}

fn setup(ports: &[(&str, i32)]) -> (Arc<OutpostContext>, Arc<MemoryStore<Service>>, ServiceReconciler) {
    let c = ctx(ports);
    let store = Arc::new(MemoryStore::<Service>::new());
    let r = ServiceReconciler::new(Arc::clone(&c), store.clone());
    (c, store, r)
}

#[tokio::test]
async fn missing_port_is_added_by_update() {
    let (c, store, r) = setup(&[("http", 80)]);
    store.seed("auth", with_ports(service::desired(&c).unwrap(), &[])).await;

    assert_eq!(reconcile_pass(&r).await.unwrap(), Outcome::Updated);
    let live = store.get("auth", &r.name()).await.unwrap();
    assert_eq!(ports_of(&live), vec![("http".to_string(), 80)]);
}

#[tokio::test]
async fn fewer_live_ports_trigger_update() {
    let (c, store, r) = setup(&[("http", 80), ("https", 443)]);
    store.seed("auth", with_ports(service::desired(&c).unwrap(), &[("http", 80)])).await;

    assert_eq!(reconcile_pass(&r).await.unwrap(), Outcome::Updated);
    assert_eq!(store.calls().await, vec![StoreOp::Retrieve, StoreOp::Update]);
}

#[tokio::test]
async fn extra_live_port_is_left_alone() {
    let (c, store, r) = setup(&[("http", 80)]);
    store.seed("auth", with_ports(service::desired(&c).unwrap(), &[("http", 80), ("metrics", 9090)])).await;

    assert_eq!(reconcile_pass(&r).await.unwrap(), Outcome::Unchanged);
    assert_eq!(store.mutations(), 0);
    let live = store.get("auth", &r.name()).await.unwrap();
    assert_eq!(ports_of(&live).len(), 2);
}

#[tokio::test]
async fn absent_object_is_created_never_updated() {
    let (_c, store, r) = setup(&[("http", 80)]);

    assert_eq!(reconcile_pass(&r).await.unwrap(), Outcome::Created);
    assert_eq!(store.calls().await, vec![StoreOp::Retrieve, StoreOp::Create]);
}

#[tokio::test]
async fn second_pass_is_unchanged_without_mutations() {
    let (_c, store, r) = setup(&[("http", 80), ("https", 443)]);

    assert_eq!(reconcile_pass(&r).await.unwrap(), Outcome::Created);
    let after_create = store.mutations();
    for _ in 0..3 {
        assert_eq!(reconcile_pass(&r).await.unwrap(), Outcome::Unchanged);
    }
    assert_eq!(store.mutations(), after_create);
}

#[tokio::test]
async fn drifted_object_converges() {
    let (c, store, r) = setup(&[("http", 80)]);
    let mut drifted = with_ports(service::desired(&c).unwrap(), &[("admin", 8080)]);
    let spec = drifted.spec.as_mut().unwrap();
    spec.selector = Some(BTreeMap::from([("app".to_string(), "legacy".to_string())]));
    spec.type_ = Some("NodePort".into());
    drifted.metadata.labels = None;
    store.seed("auth", drifted).await;

    let mut passes = Vec::new();
    for _ in 0..3 {
        let o = reconcile_pass(&r).await.unwrap();
        let done = o == Outcome::Unchanged;
        passes.push(o);
        if done {
            break;
        }
    }
    assert_eq!(passes, vec![Outcome::Updated, Outcome::Unchanged]);
    let live = store.get("auth", &r.name()).await.unwrap();
    assert_eq!(live.spec.unwrap().selector.as_ref(), Some(c.labels.as_map()));
}

#[tokio::test]
async fn transport_failure_is_reported_not_retried() {
    let (_c, store, r) = setup(&[("http", 80)]);
    store
        .inject(StoreOp::Retrieve, StoreError::Transport { op: StoreOp::Retrieve, key: "Service/auth/x".into(), message: "connection refused".into() })
        .await;

    match reconcile_pass(&r).await.unwrap() {
        Outcome::Failed(reason) => assert!(reason.contains("connection refused"), "reason={}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(store.calls().await, vec![StoreOp::Retrieve]);
    assert_eq!(store.mutations(), 0);
}

#[tokio::test]
async fn conflicting_writer_surfaces_as_failure() {
    let (c, store, r) = setup(&[("http", 80)]);
    store.seed("auth", with_ports(service::desired(&c).unwrap(), &[])).await;
    store
        .inject(StoreOp::Update, StoreError::Conflict { key: "Service/auth/x".into(), message: "field managed by helm".into() })
        .await;

    assert!(reconcile_pass(&r).await.unwrap().is_failure());
    assert_eq!(store.calls().await, vec![StoreOp::Retrieve, StoreOp::Update]);
    // the next pass heals it
    assert_eq!(reconcile_pass(&r).await.unwrap(), Outcome::Updated);
}

#[tokio::test]
async fn create_race_surfaces_already_exists() {
    let (_c, store, r) = setup(&[("http", 80)]);
    store.inject(StoreOp::Create, StoreError::AlreadyExists { key: "Service/auth/x".into() }).await;

    match reconcile_pass(&r).await.unwrap() {
        Outcome::Failed(reason) => assert!(reason.contains("already exists"), "reason={}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
}
