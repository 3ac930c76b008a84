//! Run identity: one immutable context per process invocation.
//!
//! The context is stamped onto every manifest, health update and usage
//! ledger line written during the run, and also resolves the standard
//! locations of persisted state under the run root.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Relative location of the provider circuit/cooldown document.
pub const PROVIDER_STATE_PATH: &str = "mirrors/ops/provider-state.json";
/// Relative location of the cross-run budget ledger.
pub const BUDGET_LEDGER_PATH: &str = "mirrors/ops/budget-ledger.v3.json";
/// Relative location of the append-only usage ledger.
pub const USAGE_LEDGER_PATH: &str = "mirrors/ops/usage-ledger.v3.ndjson";
/// Relative directory holding run lock files.
pub const LOCK_DIR: &str = "mirrors/ops/locks";
/// Relative location of the system health document.
pub const HEALTH_PATH: &str = "public/data/v3/system/health.json";

/// Identity of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub commit: String,
    pub policy_commit: String,
    pub generated_at: DateTime<Utc>,
    pub root_dir: PathBuf,
}

impl RunContext {
    pub fn new(
        root_dir: impl Into<PathBuf>,
        run_id: impl Into<String>,
        commit: impl Into<String>,
        policy_commit: impl Into<String>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            commit: commit.into(),
            policy_commit: policy_commit.into(),
            generated_at,
            root_dir: root_dir.into(),
        }
    }

    /// Build the context from the environment.
    ///
    /// - `RV_RUN_ID`, else a derived id (see [`derive_run_id`])
    /// - `GITHUB_SHA`, else `RV_COMMIT`, else `"local"`
    /// - `RV_POLICY_COMMIT`, else `policy_fingerprint`, else the commit
    pub fn from_env(root_dir: impl Into<PathBuf>, policy_fingerprint: Option<&str>) -> Self {
        let generated_at = Utc::now();
        let commit = env_non_empty("GITHUB_SHA")
            .or_else(|| env_non_empty("RV_COMMIT"))
            .unwrap_or_else(|| "local".to_string());
        let run_id =
            env_non_empty("RV_RUN_ID").unwrap_or_else(|| derive_run_id(&commit, generated_at));
        let policy_commit = env_non_empty("RV_POLICY_COMMIT")
            .or_else(|| policy_fingerprint.map(str::to_string))
            .unwrap_or_else(|| commit.clone());

        Self::new(root_dir, run_id, commit, policy_commit, generated_at)
    }

    /// `generated_at` as ISO-8601 with millisecond precision and a `Z` suffix.
    pub fn generated_at_iso(&self) -> String {
        self.generated_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// UTC calendar day of this run.
    pub fn as_of_date(&self) -> NaiveDate {
        self.generated_at.date_naive()
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Resolve a root-relative path.
    pub fn resolve(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root_dir.join(rel)
    }

    pub fn provider_state_path(&self) -> PathBuf {
        self.resolve(PROVIDER_STATE_PATH)
    }

    pub fn budget_ledger_path(&self) -> PathBuf {
        self.resolve(BUDGET_LEDGER_PATH)
    }

    pub fn usage_ledger_path(&self) -> PathBuf {
        self.resolve(USAGE_LEDGER_PATH)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.resolve(LOCK_DIR)
    }

    pub fn health_path(&self) -> PathBuf {
        self.resolve(HEALTH_PATH)
    }
}

/// `{yyyymmddThhmmssZ}-{8 hex}` where the suffix is a BLAKE3 digest of the
/// commit, timestamp and process id.
pub fn derive_run_id(commit: &str, at: DateTime<Utc>) -> String {
    let seed = format!(
        "{commit}|{}|{}",
        at.timestamp_nanos_opt().unwrap_or_default(),
        std::process::id()
    );
    let digest = blake3::hash(seed.as_bytes()).to_hex();
    format!("{}-{}", at.format("%Y%m%dT%H%M%SZ"), &digest.as_str()[..8])
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap()
    }

    #[test]
    fn iso_timestamp_has_millis_and_z() {
        let ctx = RunContext::new("/tmp/root", "r1", "abc", "pol", fixed());
        assert_eq!(ctx.generated_at_iso(), "2026-03-04T05:06:07.000Z");
        assert_eq!(ctx.as_of_date(), NaiveDate::from_ymd_opt(2026, 3, 4).unwrap());
    }

    #[test]
    fn derived_run_id_shape() {
        let id = derive_run_id("abc", fixed());
        assert!(id.starts_with("20260304T050607Z-"));
        assert_eq!(id.len(), "20260304T050607Z-".len() + 8);
    }

    #[test]
    fn state_paths_live_under_root() {
        let ctx = RunContext::new("/data", "r1", "abc", "pol", fixed());
        assert_eq!(
            ctx.provider_state_path(),
            PathBuf::from("/data/mirrors/ops/provider-state.json")
        );
        assert_eq!(
            ctx.health_path(),
            PathBuf::from("/data/public/data/v3/system/health.json")
        );
        assert_eq!(ctx.lock_dir(), PathBuf::from("/data/mirrors/ops/locks"));
    }
}
