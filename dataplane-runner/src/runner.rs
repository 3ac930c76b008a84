//! Stage runner: wraps one pipeline stage with lock, budget, provider
//! state and health bookkeeping.
//!
//! `StageRunner::run` does, in order:
//! 1. acquire the run lock (held = `StageOutcome::LockHeld`, not an error)
//! 2. initialise the budget ledger from policy
//! 3. run the stage
//! 4. persist provider state, success or not
//! 5. patch the health document, with an `error` entry on failure
//! 6. release the lock

use serde_json::{json, Value};
use std::path::Path;
use thiserror::Error;
use tracing::{error, info, warn};

use dataplane_core::artifact::ArtifactError;
use dataplane_core::budget::{BudgetError, BudgetLedger, BudgetLedgerStore};
use dataplane_core::fetch::{HttpTransport, Sleeper};
use dataplane_core::health::{stage_patch, HealthStatus, HealthStore, StageHealthEntry};
use dataplane_core::lock::{LockDocument, LockError, LockKey, LockOutcome, RunLock, DEFAULT_TTL_SECONDS};
use dataplane_core::policy::RetentionPolicy;
use dataplane_core::store::StoreError;
use dataplane_core::taxonomy::{classify, Classification};
use dataplane_core::{ArtifactWriter, PolicySet, RunContext};

use crate::config::{ProviderConfig, Secrets};
use crate::providers::{ProviderCallError, ProviderClients};
use crate::universe::UniverseError;

/// Errors that end a stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Universe(#[from] UniverseError),

    #[error(transparent)]
    Provider(#[from] ProviderCallError),

    #[error("PROVIDER_STATE_IO:{0}")]
    ProviderState(#[source] StoreError),

    #[error("HEALTH_IO:{0}")]
    Health(#[source] StoreError),

    /// Stage-specific failure, e.g. `DP1_EMPTY_RESULT`.
    #[error("{code}:{detail}")]
    Failed { code: &'static str, detail: String },
}

impl StageError {
    pub fn failed(code: &'static str, detail: impl Into<String>) -> Self {
        Self::Failed {
            code,
            detail: detail.into(),
        }
    }
}

/// What a completed stage reports back.
#[derive(Debug, Clone)]
pub struct StageReport {
    /// One-line summary printed on stdout.
    pub summary: String,
    pub health: StageHealthEntry,
}

#[derive(Debug)]
pub enum StageOutcome {
    Completed(StageReport),
    LockHeld(LockDocument),
}

/// Everything a stage may touch while it runs.
pub struct StageContext<'a> {
    pub run: &'a RunContext,
    pub policies: &'a PolicySet,
    pub providers: ProviderClients<'a>,
    pub artifacts: ArtifactWriter,
}

impl StageContext<'_> {
    pub fn root(&self) -> &Path {
        self.run.root()
    }

    pub fn classify(&self, message: &str) -> Classification {
        classify(message, &self.policies.errors)
    }
}

/// One pipeline stage.
pub trait Stage {
    /// Stage id as used in budget allocations and the health document.
    fn id(&self) -> &'static str;

    fn lock_key(&self, run: &RunContext) -> LockKey;

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageReport, StageError>;
}

pub struct StageRunner<'a> {
    run: &'a RunContext,
    policies: &'a PolicySet,
    transport: &'a dyn HttpTransport,
    sleeper: &'a dyn Sleeper,
    config: ProviderConfig,
    secrets: Secrets,
    lock_ttl_seconds: i64,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        run: &'a RunContext,
        policies: &'a PolicySet,
        transport: &'a dyn HttpTransport,
        sleeper: &'a dyn Sleeper,
    ) -> Self {
        Self {
            run,
            policies,
            transport,
            sleeper,
            config: ProviderConfig::default(),
            secrets: Secrets::default(),
            lock_ttl_seconds: DEFAULT_TTL_SECONDS,
        }
    }

    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_secrets(mut self, secrets: Secrets) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_lock_ttl(mut self, seconds: i64) -> Self {
        self.lock_ttl_seconds = seconds;
        self
    }

    pub fn run(&self, stage: &dyn Stage) -> Result<StageOutcome, StageError> {
        let lock = RunLock::new(self.run.lock_dir(), self.lock_ttl_seconds);
        let mut guard = match lock.acquire(&stage.lock_key(self.run), &self.run.run_id)? {
            LockOutcome::Acquired(guard) => guard,
            LockOutcome::Held(doc) => {
                info!(stage = stage.id(), owner = %doc.owner, expires_at = %doc.expires_at, "stage skipped, lock held");
                return Ok(StageOutcome::LockHeld(doc));
            }
        };

        let result = self.execute(stage);
        guard.release();
        result.map(StageOutcome::Completed)
    }

    fn execute(&self, stage: &dyn Stage) -> Result<StageReport, StageError> {
        let budget = match BudgetLedgerStore::init(self.run.budget_ledger_path(), &self.policies.budget) {
            Ok(budget) => budget,
            Err(e) => {
                let err = StageError::from(e);
                self.record_failure(stage, &err, None);
                return Err(err);
            }
        };

        let mut ctx = StageContext {
            run: self.run,
            policies: self.policies,
            providers: ProviderClients::new(
                self.run,
                self.policies,
                self.transport,
                self.sleeper,
                &self.config,
                &self.secrets,
                stage.id(),
                budget,
            ),
            artifacts: ArtifactWriter::new(self.run.root()),
        };

        info!(stage = stage.id(), run_id = %self.run.run_id, "stage started");
        let result = stage.run(&mut ctx);
        let saved = ctx.providers.save_state();
        let ledger = ctx.providers.budget().ledger().clone();

        match result {
            Ok(report) => {
                saved.map_err(StageError::ProviderState)?;
                let patch = stage_patch(
                    stage.id(),
                    &report.health,
                    system_block(report.health.status, &ledger, &self.policies.retention),
                );
                HealthStore::for_run(self.run)
                    .update(self.run, &patch)
                    .map_err(StageError::Health)?;
                info!(stage = stage.id(), status = report.health.status.as_str(), "stage finished");
                Ok(report)
            }
            Err(err) => {
                if let Err(e) = saved {
                    warn!(error = %e, "provider state not persisted");
                }
                self.record_failure(stage, &err, Some(&ledger));
                Err(err)
            }
        }
    }

    /// Best-effort error entry; the stage error is what gets reported.
    fn record_failure(&self, stage: &dyn Stage, err: &StageError, ledger: Option<&BudgetLedger>) {
        error!(stage = stage.id(), error = %err, "stage failed");
        let entry = StageHealthEntry::failed(err.to_string(), self.run);
        let mut system = json!({ "status": HealthStatus::Error.as_str() });
        if let Some(ledger) = ledger {
            system = system_block(HealthStatus::Error, ledger, &self.policies.retention);
        }
        if let Err(e) = HealthStore::for_run(self.run).update(self.run, &stage_patch(stage.id(), &entry, system)) {
            warn!(error = %e, "health not updated after stage failure");
        }
    }
}

fn system_block(status: HealthStatus, ledger: &BudgetLedger, retention: &RetentionPolicy) -> Value {
    json!({
        "status": status.as_str(),
        "budget": {
            "hard_cap": ledger.hard_cap,
            "reserve": ledger.reserve,
            "used_calls": ledger.used_calls,
            "safe_remaining": ledger.safe_remaining(),
        },
        "retention": {
            "strategy": retention.active_strategy,
            "hot_window_days": retention.hot_window_days,
        },
    })
}
