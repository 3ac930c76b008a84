//! Input lineage: which files a published series was derived from, and
//! whether they still match.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::warn;

use crate::hashing;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageSource {
    /// Root-relative path as declared by the caller.
    pub path: String,
    pub exists: bool,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    pub sources: Vec<LineageSource>,
    /// Caller context such as `as_of`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineageValidation {
    pub ok: bool,
    pub failures: Vec<String>,
}

/// Record existence and content hash of every declared source, in order.
pub fn build_lineage(root: &Path, sources: &[&str], extra: Map<String, Value>) -> Lineage {
    let sources = sources
        .iter()
        .map(|rel| {
            let sha256 = hash_if_present(root, rel);
            LineageSource {
                path: rel.to_string(),
                exists: sha256.is_some(),
                sha256,
            }
        })
        .collect();
    Lineage { sources, extra }
}

/// Re-check every source. A missing source yields
/// `LINEAGE_SOURCE_MISSING:<path>`, changed content
/// `LINEAGE_HASH_MISMATCH:<path>`.
pub fn validate_lineage(root: &Path, lineage: &Lineage) -> LineageValidation {
    let mut failures = Vec::new();
    for source in &lineage.sources {
        match hash_if_present(root, &source.path) {
            None => failures.push(format!("LINEAGE_SOURCE_MISSING:{}", source.path)),
            Some(actual) if source.sha256.as_deref() != Some(actual.as_str()) => {
                failures.push(format!("LINEAGE_HASH_MISMATCH:{}", source.path))
            }
            Some(_) => {}
        }
    }
    LineageValidation {
        ok: failures.is_empty(),
        failures,
    }
}

fn hash_if_present(root: &Path, rel: &str) -> Option<String> {
    let path = root.join(rel);
    if !path.is_file() {
        return None;
    }
    match hashing::sha256_file(&path) {
        Ok(hash) => Some(hash),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "lineage source unreadable");
            None
        }
    }
}
