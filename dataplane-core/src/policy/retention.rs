//! Retention of mirrors and ops ledgers. Loaded and validated here; the
//! windows are applied by [`crate::retention::run_cleanup`].

use serde::{Deserialize, Serialize};

use super::PolicyDocument;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    pub schema_version: String,
    pub active_strategy: RetentionStrategy,
    #[serde(default)]
    pub strategy_a: Option<serde_json::Value>,
    #[serde(default)]
    pub strategy_b: Option<serde_json::Value>,
    #[serde(default)]
    pub hot_window_days: Option<u32>,
    #[serde(default)]
    pub mirrors_retention_days: Option<u32>,
    #[serde(default)]
    pub ops_ledger_retention_days: Option<u32>,
    #[serde(default)]
    pub cleanup_cadence: Option<String>,
    pub safeguards: RetentionSafeguards,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionStrategy {
    A,
    B,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionSafeguards {
    pub never_remove_last_good: bool,
}

impl PolicyDocument for RetentionPolicy {
    const NAME: &'static str = "retention";

    fn validate(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if !self.safeguards.never_remove_last_good {
            failures.push("retention.safeguards.never_remove_last_good must be true".into());
        }
        if self.hot_window_days == Some(0) {
            failures.push("retention.hot_window_days must be positive when set".into());
        }
        failures
    }
}
