use std::fmt;

use serde::{Deserialize, Serialize};

/// Result of comparing a live object against its reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Divergence {
    /// Every owned field already matches.
    None,
    /// Differences the store can patch in place.
    Patchable,
    /// An immutable field differs; the object must be deleted and created again.
    Structural,
}

impl Divergence {
    /// Combine two findings, keeping the most severe.
    pub fn max(self, other: Divergence) -> Divergence {
        use Divergence::*;
        match (self, other) {
            (Structural, _) | (_, Structural) => Structural,
            (Patchable, _) | (_, Patchable) => Patchable,
            _ => None,
        }
    }

    pub fn is_none(self) -> bool { matches!(self, Divergence::None) }
}

/// Outcome of one reconciliation (or teardown) pass for one resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Unchanged,
    Created,
    Updated,
    /// Deleted and created again because of a structural difference.
    Recreated,
    /// Teardown removed the object.
    Deleted,
    /// Teardown found nothing to remove.
    Absent,
    Failed(String),
}

impl Outcome {
    pub fn is_failure(&self) -> bool { matches!(self, Outcome::Failed(_)) }

    /// Whether the pass issued at least one mutating call.
    pub fn mutated(&self) -> bool {
        matches!(self, Outcome::Created | Outcome::Updated | Outcome::Recreated | Outcome::Deleted)
    }

    /// Stable short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Unchanged => "unchanged",
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Recreated => "recreated",
            Outcome::Deleted => "deleted",
            Outcome::Absent => "absent",
            Outcome::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Per-kind outcomes of one driver run for one owning unit, in execution order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub unit: String,
    pub outcomes: Vec<(String, Outcome)>,
}

impl ReconcileReport {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into(), outcomes: Vec::new() }
    }

    pub fn push(&mut self, kind: impl Into<String>, outcome: Outcome) {
        self.outcomes.push((kind.into(), outcome));
    }

    pub fn outcome(&self, kind: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|(k, _)| k == kind).map(|(_, o)| o)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|(k, o)| match o {
            Outcome::Failed(reason) => Some((k.as_str(), reason.as_str())),
            _ => None,
        })
    }

    pub fn is_clean(&self) -> bool { self.failures().next().is_none() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divergence_max_keeps_most_severe() {
        assert_eq!(Divergence::None.max(Divergence::None), Divergence::None);
        assert_eq!(Divergence::None.max(Divergence::Patchable), Divergence::Patchable);
        assert_eq!(Divergence::Structural.max(Divergence::Patchable), Divergence::Structural);
        assert_eq!(Divergence::Patchable.max(Divergence::Structural), Divergence::Structural);
    }

    #[test]
    fn report_collects_failures() {
        let mut r = ReconcileReport::new("auth/outpost-x");
        r.push("secret", Outcome::Unchanged);
        r.push("service", Outcome::Failed("timeout".into()));
        assert!(!r.is_clean());
        assert_eq!(r.failures().collect::<Vec<_>>(), vec![("service", "timeout")]);
        assert_eq!(r.outcome("secret"), Some(&Outcome::Unchanged));
    }

    #[test]
    fn outcome_serializes_tagged() {
        let v = serde_json::to_value(Outcome::Failed("boom".into())).unwrap();
        assert_eq!(v, serde_json::json!({"outcome": "failed", "reason": "boom"}));
        let v = serde_json::to_value(Outcome::Created).unwrap();
        assert_eq!(v, serde_json::json!({"outcome": "created"}));
    }
}
