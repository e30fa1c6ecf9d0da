//! Outpost core types: owning-unit configuration, pod labels, reconcile outcomes.
//!
//! Everything here is pure data. Nothing in this crate talks to a cluster.

#![forbid(unsafe_code)]

mod outcome;
mod outpost;

pub use outcome::{Divergence, Outcome, ReconcileReport};
pub use outpost::{slugify, NamedPort, Outpost, PodLabels};

/// Label keys stamped onto every managed object.
pub mod labels {
    pub const NAME: &str = "app.kubernetes.io/name";
    pub const INSTANCE: &str = "app.kubernetes.io/instance";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const OUTPOST_UUID: &str = "outpost.io/uuid";

    /// Value of `app.kubernetes.io/managed-by`.
    pub const MANAGER: &str = "outpostctl";
}

/// Configuration problems that make it impossible to compute any desired state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("outpost {outpost}: {field} is required")]
    Missing { outpost: String, field: &'static str },
    #[error("outpost {outpost}: invalid {field}: {reason}")]
    Invalid { outpost: String, field: &'static str, reason: String },
}

pub mod prelude {
    pub use super::{ConfigError, Divergence, NamedPort, Outcome, Outpost, PodLabels, ReconcileReport};
}
