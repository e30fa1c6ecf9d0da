use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::{labels, ConfigError};

/// A named port exposed by the outpost container and its service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct NamedPort {
    pub name: String,
    pub port: i32,
}

impl NamedPort {
    pub fn new(name: impl Into<String>, port: i32) -> Self {
        Self { name: name.into(), port }
    }
}

fn default_outpost_type() -> String { "proxy".to_string() }
fn default_replicas() -> i32 { 1 }
fn default_prefix() -> String { "outpost".to_string() }

/// The owning unit: one deployment target whose cluster objects are reconciled together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Outpost {
    pub uuid: Uuid,
    pub name: String,
    pub namespace: String,
    #[serde(default = "default_outpost_type")]
    pub outpost_type: String,
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// Insertion order is kept; it is the order ports are rendered in.
    /// At least one is required: a ClusterIP service cannot be empty.
    #[serde(default)]
    pub ports: SmallVec<[NamedPort; 4]>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_prefix")]
    pub name_prefix: String,
}

impl Outpost {
    /// Minimal outpost with defaults for every optional field.
    pub fn new(uuid: Uuid, name: impl Into<String>, namespace: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            namespace: namespace.into(),
            outpost_type: default_outpost_type(),
            image: image.into(),
            replicas: default_replicas(),
            ports: SmallVec::new(),
            host: String::new(),
            insecure: false,
            token: String::new(),
            env: BTreeMap::new(),
            name_prefix: default_prefix(),
        }
    }

    pub fn with_port(mut self, name: impl Into<String>, port: i32) -> Self {
        self.ports.push(NamedPort::new(name, port));
        self
    }

    /// Name shared by every object reconciled for this outpost.
    ///
    /// Derived from the uuid only, so it is stable across renames and unique across outposts.
    pub fn resource_name(&self) -> String {
        format!("{}-{}", self.name_prefix, self.uuid.simple())
    }

    /// Identifier used in logs and reports.
    pub fn unit_key(&self) -> String {
        format!("{}/{}", self.namespace, self.resource_name())
    }

    /// Reject configurations no reconciler can compute a reference for.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let outpost = self.uuid.simple().to_string();
        if self.namespace.is_empty() {
            return Err(ConfigError::Missing { outpost, field: "namespace" });
        }
        if !is_dns_label(&self.namespace) {
            return Err(ConfigError::Invalid { outpost, field: "namespace", reason: format!("{:?} is not a DNS-1123 label", self.namespace) });
        }
        if self.image.trim().is_empty() {
            return Err(ConfigError::Missing { outpost, field: "image" });
        }
        // the prefix starts every object name, and service names must be DNS-1035
        if !is_dns1035_label(&self.name_prefix) || self.name_prefix.len() > 30 {
            return Err(ConfigError::Invalid { outpost, field: "name_prefix", reason: format!("{:?} must be a DNS-1035 label of at most 30 chars", self.name_prefix) });
        }
        if !is_dns_label(&self.outpost_type) {
            return Err(ConfigError::Invalid { outpost, field: "outpost_type", reason: format!("{:?} is not a DNS-1123 label", self.outpost_type) });
        }
        if self.replicas < 0 {
            return Err(ConfigError::Invalid { outpost, field: "replicas", reason: format!("{} is negative", self.replicas) });
        }
        if slugify(&self.name).is_empty() {
            return Err(ConfigError::Invalid { outpost, field: "name", reason: format!("{:?} has no usable characters", self.name) });
        }
        if self.ports.is_empty() {
            return Err(ConfigError::Missing { outpost, field: "ports" });
        }
        for (i, p) in self.ports.iter().enumerate() {
            if !(1..=65535).contains(&p.port) {
                return Err(ConfigError::Invalid { outpost, field: "ports", reason: format!("{} port {} out of range", p.name, p.port) });
            }
            if !is_iana_svc_name(&p.name) {
                return Err(ConfigError::Invalid { outpost, field: "ports", reason: format!("port name {:?} must be an IANA service name", p.name) });
            }
            if self.ports[..i].iter().any(|q| q.name == p.name) {
                return Err(ConfigError::Invalid { outpost, field: "ports", reason: format!("duplicate port name {}", p.name) });
            }
        }
        Ok(())
    }
}

/// Pod labels for one outpost.
///
/// Computed once per pass and handed to every reconciler that selects pods,
/// so the deployment's pod labels and the service selector cannot drift apart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodLabels(BTreeMap<String, String>);

impl PodLabels {
    pub fn for_outpost(outpost: &Outpost) -> Result<Self, ConfigError> {
        let instance = slugify(&outpost.name);
        if instance.is_empty() {
            return Err(ConfigError::Invalid {
                outpost: outpost.uuid.simple().to_string(),
                field: "name",
                reason: format!("{:?} has no usable characters", outpost.name),
            });
        }
        let mut m = BTreeMap::new();
        m.insert(labels::NAME.to_string(), format!("{}-{}", outpost.name_prefix, outpost.outpost_type));
        m.insert(labels::INSTANCE.to_string(), instance);
        m.insert(labels::MANAGED_BY.to_string(), labels::MANAGER.to_string());
        m.insert(labels::OUTPOST_UUID.to_string(), outpost.uuid.simple().to_string());
        Ok(Self(m))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> { &self.0 }

    pub fn to_map(&self) -> BTreeMap<String, String> { self.0.clone() }

    /// True when every label here is present with the same value in `other`.
    pub fn is_subset_of(&self, other: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

/// Lowercase, alphanumerics and single dashes, at most 63 chars (a valid label value).
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.truncate(63);
    while out.ends_with('-') { out.pop(); }
    out
}

fn is_dns_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(f), Some(l)) => {
            s.len() <= 63
                && f.is_ascii_alphanumeric()
                && l.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase() || *b == b'-')
        }
        _ => false,
    }
}

/// DNS-1123 label that also starts with a letter.
fn is_dns1035_label(s: &str) -> bool {
    is_dns_label(s) && s.as_bytes()[0].is_ascii_lowercase()
}

/// At most 15 chars of lowercase alphanumerics and dashes, at least one letter,
/// no leading, trailing or doubled dash.
fn is_iana_svc_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 15
        && s.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase() || b == b'-')
        && s.bytes().any(|b| b.is_ascii_lowercase())
        && !s.starts_with('-')
        && !s.ends_with('-')
        && !s.contains("--")
}
