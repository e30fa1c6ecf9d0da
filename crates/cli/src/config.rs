//! Outpost definitions file.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use outpost_core::Outpost;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct OutpostFile {
    #[serde(default)]
    outposts: Vec<Outpost>,
}

/// Parse an `outposts:` list from YAML (or JSON) and validate every entry.
pub fn parse(text: &str) -> Result<Vec<Outpost>> {
    let file: OutpostFile = serde_yaml::from_str(text).context("parsing outpost definitions")?;
    let mut seen = BTreeSet::new();
    for o in &file.outposts {
        o.validate().with_context(|| format!("outpost {:?}", o.name))?;
        if !seen.insert(o.unit_key()) {
            bail!("outpost {:?} is defined twice ({})", o.name, o.unit_key());
        }
    }
    Ok(file.outposts)
}

pub fn load(path: &Path) -> Result<Vec<Outpost>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let outposts = parse(&text).with_context(|| format!("loading {}", path.display()))?;
    if outposts.is_empty() {
        tracing::warn!(path = %path.display(), "no outposts defined");
    }
    Ok(outposts)
}
