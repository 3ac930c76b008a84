//! Call-budget policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::PolicyDocument;

/// Caps for the cross-run call budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetPolicy {
    pub schema_version: String,
    #[serde(default)]
    pub currency: Option<String>,
    /// Total calls allowed across all stages.
    pub hard_cap: u64,
    /// Calls no single stage may consume.
    pub reserve: u64,
    /// Budget is checked before any network call. Must be `true`.
    pub stop_before_calls: bool,
    /// Informational share per stage (fractions of the cap).
    #[serde(default)]
    pub allocations: BTreeMap<String, f64>,
    /// Per-stage cap overrides; stages without one are capped at `hard_cap`.
    #[serde(default)]
    pub max_planned_calls: BTreeMap<String, u64>,
    /// Usage rollover period. Absent = usage accumulates forever.
    #[serde(default)]
    pub period: Option<BudgetPeriod>,
}

/// Rollover period for ledger usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Monthly,
}

impl BudgetPeriod {
    /// Period key for an instant: `YYYY-MM-DD` or `YYYY-MM`.
    pub fn key(&self, at: DateTime<Utc>) -> String {
        match self {
            Self::Daily => at.format("%Y-%m-%d").to_string(),
            Self::Monthly => at.format("%Y-%m").to_string(),
        }
    }
}

impl BudgetPolicy {
    /// Cap for one stage: its override, else the hard cap.
    pub fn stage_cap(&self, stage: &str) -> u64 {
        self.max_planned_calls
            .get(stage)
            .copied()
            .unwrap_or(self.hard_cap)
    }
}

impl PolicyDocument for BudgetPolicy {
    const NAME: &'static str = "budget";

    fn validate(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.hard_cap == 0 {
            failures.push("budget.hard_cap must be positive".to_string());
        }
        if self.reserve > self.hard_cap {
            failures.push("budget.reserve must not exceed hard_cap".to_string());
        }
        if !self.stop_before_calls {
            failures.push("budget.stop_before_calls must be true".to_string());
        }
        for (stage, cap) in &self.max_planned_calls {
            if *cap > self.hard_cap {
                failures.push(format!(
                    "budget.max_planned_calls.{stage} ({cap}) exceeds hard_cap"
                ));
            }
        }
        failures
    }
}
