//! Cross-run call budget.
//!
//! The ledger at `mirrors/ops/budget-ledger.v3.json` carries cumulative
//! usage between runs. Caps (`hard_cap`, `reserve`) are re-read from the
//! budget policy on every run; usage is only ever changed by
//! [`BudgetLedgerStore::consume`], which persists after each increment.
//!
//! A stage asserts its planned call count before touching the network.
//! The reserve is never available to any single stage.

pub mod usage;

pub use usage::{EndpointBudget, UsageCollector, UsageEvent, UsageLedger};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::policy::BudgetPolicy;
use crate::store::{self, StoreError};

pub const LEDGER_SCHEMA_VERSION: &str = "v3";
/// Archived periods kept in the ledger history.
pub const HISTORY_LIMIT: usize = 90;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("BUDGET_EXHAUSTED:{stage} planned={planned} remaining={remaining}")]
    Exhausted {
        stage: String,
        planned: u64,
        remaining: i64,
    },

    #[error("BUDGET_STAGE_CAP_EXCEEDED:{stage} planned={planned} cap={cap}")]
    StageCapExceeded { stage: String, planned: u64, cap: u64 },

    #[error("BUDGET_LEDGER_IO:{0}")]
    Store(#[from] StoreError),
}

/// One archived usage period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodUsage {
    pub period: String,
    pub used_calls: u64,
    #[serde(default)]
    pub used_calls_by_stage: BTreeMap<String, u64>,
    pub rolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub schema_version: String,
    pub hard_cap: u64,
    pub reserve: u64,
    pub used_calls: u64,
    #[serde(default)]
    pub used_calls_by_stage: BTreeMap<String, u64>,
    /// Current period key when the policy configures rollover.
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub history: Vec<PeriodUsage>,
    pub updated_at: DateTime<Utc>,
}

impl BudgetLedger {
    fn fresh(policy: &BudgetPolicy, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: LEDGER_SCHEMA_VERSION.to_string(),
            hard_cap: policy.hard_cap,
            reserve: policy.reserve,
            used_calls: 0,
            used_calls_by_stage: BTreeMap::new(),
            period: policy.period.map(|p| p.key(now)),
            history: Vec::new(),
            updated_at: now,
        }
    }

    /// Calls still available to a stage: `hard_cap - used_calls - reserve`.
    /// Negative once usage has eaten into the reserve.
    pub fn safe_remaining(&self) -> i64 {
        self.hard_cap as i64 - self.used_calls as i64 - self.reserve as i64
    }

    pub fn used_by_stage(&self, stage: &str) -> u64 {
        self.used_calls_by_stage.get(stage).copied().unwrap_or(0)
    }

    /// Re-apply caps from policy and roll usage over when the period changed.
    fn apply_policy(&mut self, policy: &BudgetPolicy, now: DateTime<Utc>) {
        self.hard_cap = policy.hard_cap;
        self.reserve = policy.reserve;

        let Some(period) = policy.period else {
            self.period = None;
            return;
        };
        let current = period.key(now);
        match &self.period {
            Some(existing) if *existing == current => {}
            Some(existing) => {
                info!(from = %existing, to = %current, used = self.used_calls, "budget period rolled over");
                self.history.push(PeriodUsage {
                    period: existing.clone(),
                    used_calls: self.used_calls,
                    used_calls_by_stage: std::mem::take(&mut self.used_calls_by_stage),
                    rolled_at: now,
                });
                if self.history.len() > HISTORY_LIMIT {
                    let excess = self.history.len() - HISTORY_LIMIT;
                    self.history.drain(..excess);
                }
                self.used_calls = 0;
                self.period = Some(current);
            }
            None => self.period = Some(current),
        }
    }

    /// Fail fast unless `planned` fits both the stage cap and the safe
    /// remaining budget. Zero planned calls always passes.
    pub fn assert_before_calls(
        &self,
        planned: &PlannedCalls,
    ) -> Result<(), BudgetError> {
        if planned.planned == 0 {
            return Ok(());
        }
        if planned.planned > planned.stage_cap {
            return Err(BudgetError::StageCapExceeded {
                stage: planned.stage.clone(),
                planned: planned.planned,
                cap: planned.stage_cap,
            });
        }
        let remaining = self.safe_remaining();
        if planned.planned as i64 > remaining {
            return Err(BudgetError::Exhausted {
                stage: planned.stage.clone(),
                planned: planned.planned,
                remaining,
            });
        }
        Ok(())
    }
}

/// A stage's intended call count together with its resolved cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCalls {
    pub stage: String,
    pub planned: u64,
    pub stage_cap: u64,
}

/// Resolve the cap for `stage` (its override, else `hard_cap`).
pub fn estimate_planned_calls(stage: &str, planned: u64, policy: &BudgetPolicy) -> PlannedCalls {
    PlannedCalls {
        stage: stage.to_string(),
        planned,
        stage_cap: policy.stage_cap(stage),
    }
}

/// Owns the persisted ledger for one run.
#[derive(Debug)]
pub struct BudgetLedgerStore {
    path: PathBuf,
    ledger: BudgetLedger,
}

impl BudgetLedgerStore {
    /// Load the ledger, reset caps from policy, roll the period, persist.
    pub fn init(path: impl Into<PathBuf>, policy: &BudgetPolicy) -> Result<Self, BudgetError> {
        Self::init_at(path, policy, Utc::now())
    }

    pub fn init_at(
        path: impl Into<PathBuf>,
        policy: &BudgetPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, BudgetError> {
        let path = path.into();
        let mut ledger = match store::read_json::<BudgetLedger>(&path)? {
            Some(ledger) => ledger,
            None => BudgetLedger::fresh(policy, now),
        };
        ledger.apply_policy(policy, now);
        ledger.updated_at = now;
        store::write_json_atomic(&path, &ledger)?;
        debug!(path = %path.display(), used = ledger.used_calls, "budget ledger initialised");
        Ok(Self { path, ledger })
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn assert_budget_before_calls(&self, planned: &PlannedCalls) -> Result<(), BudgetError> {
        self.ledger.assert_before_calls(planned)
    }

    /// Record `calls` against `stage` and persist immediately.
    pub fn consume(&mut self, stage: &str, calls: u64) -> Result<(), BudgetError> {
        self.consume_at(stage, calls, Utc::now())
    }

    pub fn consume_at(&mut self, stage: &str, calls: u64, now: DateTime<Utc>) -> Result<(), BudgetError> {
        if calls == 0 {
            return Ok(());
        }
        self.ledger.used_calls += calls;
        *self
            .ledger
            .used_calls_by_stage
            .entry(stage.to_string())
            .or_insert(0) += calls;
        self.ledger.updated_at = now;
        store::write_json_atomic(&self.path, &self.ledger)?;
        debug!(stage, calls, used = self.ledger.used_calls, "budget consumed");
        Ok(())
    }
}
