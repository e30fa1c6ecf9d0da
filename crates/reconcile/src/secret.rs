//! Secret holding the outpost's connection settings.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use outpost_core::Divergence;
use outpost_kubehub::ObjectStore;

use crate::{meta_divergence, OutpostContext, ReconcileError, Reconciler};

pub const KIND: &str = "secret";

pub const KEY_HOST: &str = "host";
pub const KEY_INSECURE: &str = "insecure";
pub const KEY_TOKEN: &str = "token";

const SECRET_TYPE: &str = "Opaque";

pub fn desired(ctx: &OutpostContext) -> Result<Secret, ReconcileError> {
    let o = &ctx.outpost;
    if o.token.is_empty() {
        return Err(ReconcileError::Misconfigured { kind: KIND, reason: "outpost token is empty".into() });
    }
    let mut data = BTreeMap::new();
    data.insert(KEY_HOST.to_string(), ByteString(o.host.as_bytes().to_vec()));
    data.insert(KEY_INSECURE.to_string(), ByteString(o.insecure.to_string().into_bytes()));
    data.insert(KEY_TOKEN.to_string(), ByteString(o.token.as_bytes().to_vec()));
    Ok(Secret {
        metadata: ctx.object_meta(),
        data: Some(data),
        type_: Some(SECRET_TYPE.to_string()),
        ..Default::default()
    })
}

/// `type` is immutable; data keys we own must match, other keys are left alone.
pub fn compare(current: &Secret, reference: &Secret) -> Divergence {
    let live_type = current.type_.as_deref().unwrap_or(SECRET_TYPE);
    let ref_type = reference.type_.as_deref().unwrap_or(SECRET_TYPE);
    if live_type != ref_type {
        return Divergence::Structural;
    }
    let empty = BTreeMap::new();
    let live = current.data.as_ref().unwrap_or(&empty);
    let data_ok = reference
        .data
        .as_ref()
        .map(|d| d.iter().all(|(k, v)| live.get(k) == Some(v)))
        .unwrap_or(true);
    let data = if data_ok { Divergence::None } else { Divergence::Patchable };
    data.max(meta_divergence(&current.metadata, &reference.metadata))
}

pub struct SecretReconciler {
    ctx: Arc<OutpostContext>,
    store: Arc<dyn ObjectStore<Secret>>,
}

impl SecretReconciler {
    pub fn new(ctx: Arc<OutpostContext>, store: Arc<dyn ObjectStore<Secret>>) -> Self {
        Self { ctx, store }
    }
}

impl Reconciler for SecretReconciler {
    type Object = Secret;

    fn kind(&self) -> &'static str { KIND }

    fn namespace(&self) -> &str { self.ctx.namespace() }

    fn name(&self) -> String { self.ctx.name() }

    fn store(&self) -> &dyn ObjectStore<Secret> { self.store.as_ref() }

    fn get_reference(&self) -> Result<Secret, ReconcileError> { desired(&self.ctx) }

    fn compare(&self, current: &Secret, reference: &Secret) -> Divergence { compare(current, reference) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core::Outpost;
    use uuid::Uuid;

    fn ctx() -> OutpostContext {
        let mut o = Outpost::new(Uuid::from_u128(1), "proxy", "auth", "img:1").with_port("http", 9000);
        o.token = "secret-token".into();
        o.host = "https://auth.example.com".into();
        OutpostContext::new(o).unwrap()
    }

    #[test]
    fn reference_carries_connection_settings() {
        let s = desired(&ctx()).unwrap();
        let data = s.data.unwrap();
        assert_eq!(data[KEY_TOKEN].0, b"secret-token");
        assert_eq!(data[KEY_INSECURE].0, b"false");
        assert_eq!(data[KEY_HOST].0, b"https://auth.example.com");
    }

    #[test]
    fn empty_token_is_misconfiguration() {
        let mut c = ctx();
        c.outpost.token.clear();
        assert!(matches!(desired(&c), Err(ReconcileError::Misconfigured { kind: KIND, .. })));
    }

    #[test]
    fn extra_live_keys_are_tolerated() {
        let reference = desired(&ctx()).unwrap();
        let mut live = reference.clone();
        live.data.as_mut().unwrap().insert("ca.crt".into(), ByteString(b"pem".to_vec()));
        live.metadata.resource_version = Some("9".into());
        assert_eq!(compare(&live, &reference), Divergence::None);
    }

    #[test]
    fn changed_token_is_patchable_and_type_change_structural() {
        let reference = desired(&ctx()).unwrap();
        let mut live = reference.clone();
        live.data.as_mut().unwrap().insert(KEY_TOKEN.into(), ByteString(b"old".to_vec()));
        assert_eq!(compare(&live, &reference), Divergence::Patchable);

        let mut live = reference.clone();
        live.type_ = Some("kubernetes.io/tls".into());
        assert_eq!(compare(&live, &reference), Divergence::Structural);
    }
}
