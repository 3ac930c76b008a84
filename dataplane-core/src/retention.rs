//! Retention cleanup for mirrors and drift reports.
//!
//! Files under `mirrors/` older than `mirrors_retention_days` and drift
//! reports older than `ops_ledger_retention_days` are removed, measured by
//! modification time against the run's `generated_at`. Any path with a
//! `last_good` component is kept regardless of age. The run writes a
//! cleanup report and stamps `system.retention.last_cleanup` in health.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::artifact::{relative_to, ArtifactError, ArtifactWriter};
use crate::health::HealthStore;
use crate::policy::retention::{RetentionPolicy, RetentionStrategy};
use crate::run_context::RunContext;
use crate::store::StoreError;

pub const CLEANUP_REPORT_PATH: &str = "public/data/v3/system/retention-cleanup.latest.json";
pub const CLEANUP_SCHEMA: &str = "rv.retention.cleanup.v1";
pub const MIRRORS_DIR: &str = "mirrors";
pub const DRIFT_DIR: &str = "public/data/v3/system/drift";

const DEFAULT_MIRRORS_RETENTION_DAYS: u32 = 180;
const DEFAULT_OPS_LEDGER_RETENTION_DAYS: u32 = 365;
const LAST_GOOD_MARKER: &str = "last_good";

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("RETENTION_SCAN_FAILED:{dir}: {source}")]
    Scan {
        dir: String,
        #[source]
        source: walkdir::Error,
    },

    #[error("RETENTION_IO:{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupMeta {
    pub schema: String,
    pub generated_at: String,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupWindows {
    pub strategy: RetentionStrategy,
    pub mirrors_retention_days: u32,
    pub ops_ledger_retention_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemovedCounts {
    pub mirrors: usize,
    pub drift_reports: usize,
}

/// What one cleanup run removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub meta: CleanupMeta,
    pub policy: CleanupWindows,
    pub removed: RemovedCounts,
    /// Expired files kept because they are last-known-good.
    pub kept_last_good: usize,
}

impl CleanupReport {
    pub fn summary(&self) -> String {
        format!(
            "RETENTION_CLEANUP_OK mirrors={} drift={}",
            self.removed.mirrors, self.removed.drift_reports
        )
    }
}

fn is_last_good(rel: &str) -> bool {
    rel.split('/').any(|part| part.contains(LAST_GOOD_MARKER))
}

#[derive(Debug, Default)]
struct Sweep {
    removed: usize,
    kept_last_good: usize,
}

/// Remove files under `root/dir` last modified before `cutoff`.
fn sweep(root: &Path, dir: &str, cutoff: DateTime<Utc>) -> Result<Sweep, RetentionError> {
    let base = root.join(dir);
    let mut sweep = Sweep::default();
    if !base.is_dir() {
        debug!(dir, "nothing to clean");
        return Ok(sweep);
    }

    let mut expired = Vec::new();
    for entry in WalkDir::new(&base).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|source| RetentionError::Scan {
            dir: dir.to_string(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .map_err(|source| RetentionError::Scan {
                dir: dir.to_string(),
                source,
            })?
            .modified()
            .map_err(|source| RetentionError::Io {
                path: entry.path().to_path_buf(),
                source,
            })?;
        if DateTime::<Utc>::from(modified) >= cutoff {
            continue;
        }
        if is_last_good(&relative_to(root, entry.path())) {
            sweep.kept_last_good += 1;
            continue;
        }
        expired.push(entry.into_path());
    }

    for path in expired {
        std::fs::remove_file(&path).map_err(|source| RetentionError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "expired file removed");
        sweep.removed += 1;
    }
    Ok(sweep)
}

/// Apply the retention windows, write the report and patch health.
pub fn run_cleanup(run: &RunContext, policy: &RetentionPolicy) -> Result<CleanupReport, RetentionError> {
    let windows = CleanupWindows {
        strategy: policy.active_strategy,
        mirrors_retention_days: policy
            .mirrors_retention_days
            .unwrap_or(DEFAULT_MIRRORS_RETENTION_DAYS),
        ops_ledger_retention_days: policy
            .ops_ledger_retention_days
            .unwrap_or(DEFAULT_OPS_LEDGER_RETENTION_DAYS),
    };
    let mirrors_cutoff = run.generated_at - Duration::days(i64::from(windows.mirrors_retention_days));
    let drift_cutoff = run.generated_at - Duration::days(i64::from(windows.ops_ledger_retention_days));

    let mirrors = sweep(run.root(), MIRRORS_DIR, mirrors_cutoff)?;
    let drift = sweep(run.root(), DRIFT_DIR, drift_cutoff)?;

    let report = CleanupReport {
        meta: CleanupMeta {
            schema: CLEANUP_SCHEMA.to_string(),
            generated_at: run.generated_at_iso(),
            run_id: run.run_id.clone(),
        },
        policy: windows,
        removed: RemovedCounts {
            mirrors: mirrors.removed,
            drift_reports: drift.removed,
        },
        kept_last_good: mirrors.kept_last_good + drift.kept_last_good,
    };
    ArtifactWriter::new(run.root()).write_json(CLEANUP_REPORT_PATH, &report)?;
    HealthStore::for_run(run).update(
        run,
        &json!({
            "system": {
                "retention": {
                    "strategy": report.policy.strategy,
                    "last_cleanup": report.meta.generated_at,
                }
            }
        }),
    )?;
    info!(
        mirrors = report.removed.mirrors,
        drift = report.removed.drift_reports,
        kept_last_good = report.kept_last_good,
        "retention cleanup finished"
    );
    Ok(report)
}
