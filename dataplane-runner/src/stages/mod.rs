//! Pipeline stages.
//!
//! - `universe_sync` (dp0): mapped universe and drift against the source list
//! - `eod_snapshot` (dp1): end-of-day bars per mapped symbol
//! - `corporate_actions` (dp2): splits and dividends
//! - `adjusted_series` (dp3): adjusted close series with input lineage
//! - `news_signals` (dp5): headlines for the day's top movers

pub mod adjusted_series;
pub mod corporate_actions;
pub mod eod_snapshot;
pub mod news_signals;
pub mod universe_sync;

pub use adjusted_series::AdjustedSeries;
pub use corporate_actions::CorporateActions;
pub use eod_snapshot::EodSnapshot;
pub use news_signals::NewsSignals;
pub use universe_sync::UniverseSync;

use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::{debug, warn};

/// Schema stamped on every stage manifest.
pub const MANIFEST_SCHEMA: &str = "rv.manifest.v3";

/// Rows of a previously published gzip NDJSON artifact. A missing file
/// reads as empty; an unreadable one is logged and read as empty.
pub(crate) fn read_last_good<T: DeserializeOwned>(root: &Path, rel: &str) -> Vec<T> {
    let path = root.join(rel);
    if !path.is_file() {
        debug!(path = rel, "no last-known-good artifact");
        return Vec::new();
    }
    match dataplane_core::artifact::read_gzip_ndjson(&path) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(path = rel, error = %e, "last-known-good artifact unreadable");
            Vec::new()
        }
    }
}

/// `observed / expected`, 0 when nothing was expected.
pub(crate) fn coverage_ratio(observed: usize, expected: usize) -> f64 {
    if expected == 0 {
        0.0
    } else {
        observed as f64 / expected as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataplane_core::ArtifactWriter;
    use serde_json::{json, Value};

    #[test]
    fn last_good_reads_published_rows() {
        let dir = tempfile::tempdir().unwrap();
        ArtifactWriter::new(dir.path())
            .write_gzip_ndjson("a/latest.ndjson.gz", &[json!({"x": 1}), json!({"x": 2})])
            .unwrap();
        let rows: Vec<Value> = read_last_good(dir.path(), "a/latest.ndjson.gz");
        assert_eq!(rows.len(), 2);
        let none: Vec<Value> = read_last_good(dir.path(), "a/missing.ndjson.gz");
        assert!(none.is_empty());
    }

    #[test]
    fn corrupt_last_good_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.ndjson.gz"), b"not gzip").unwrap();
        let rows: Vec<Value> = read_last_good(dir.path(), "bad.ndjson.gz");
        assert!(rows.is_empty());
    }

    #[test]
    fn coverage_of_nothing_is_zero() {
        assert_eq!(coverage_ratio(0, 0), 0.0);
        assert_eq!(coverage_ratio(3, 4), 0.75);
    }
}
