//! Owned-field drift summaries between a reference and a live object.
//!
//! Only used for logging; convergence decisions come from each reconciler's `compare`.
//! The walk follows the same policy: only fields the reference sets are looked at,
//! extra live keys and list entries are ignored, and an empty reference value
//! matches an absent live one.

use std::fmt;

use serde::Serialize;
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// Reference fields or list entries the live object lacks.
    pub missing: usize,
    /// Reference scalars the live object holds with another value.
    pub changed: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.missing == 0 && self.changed == 0 }
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} missing, {} changed", self.missing, self.changed)
    }
}

/// Summarize where `live` falls short of `reference`. `None` if either side fails to serialize.
pub fn summarize<T: Serialize>(reference: &T, live: &T) -> Option<DiffSummary> {
    let reference = serde_json::to_value(reference).ok()?;
    let live = serde_json::to_value(live).ok()?;
    let mut out = DiffSummary::default();
    walk(&reference, &live, &mut out);
    Some(out)
}

fn is_empty_value(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::String(s) => s.is_empty(),
        Json::Array(a) => a.is_empty(),
        Json::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// List entries are matched by `name` when they carry one (ports, containers, env).
fn entry_name(v: &Json) -> Option<&str> {
    v.get("name").and_then(Json::as_str)
}

fn walk(want: &Json, live: &Json, out: &mut DiffSummary) {
    match (want, live) {
        (Json::Object(w), Json::Object(l)) => {
            for (k, wv) in w {
                match l.get(k) {
                    Some(lv) => walk(wv, lv, out),
                    None if is_empty_value(wv) => {}
                    None => out.missing += 1,
                }
            }
        }
        (Json::Array(w), Json::Array(l)) => {
            for wv in w {
                if l.contains(wv) {
                    continue;
                }
                match entry_name(wv).and_then(|n| l.iter().find(|lv| entry_name(lv) == Some(n))) {
                    Some(lv) => walk(wv, lv, out),
                    None => out.missing += 1,
                }
            }
        }
        (w, l) if w == l => {}
        (w, Json::Null) if is_empty_value(w) => {}
        _ => out.changed += 1,
    }
}
