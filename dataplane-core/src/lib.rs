//! Dataplane Core: the substrate every pipeline stage runs on.
//!
//! This crate contains the pieces that make unattended runs against
//! fallible providers safe and reproducible:
//! - Run identity and standard state locations
//! - Typed, validated policy documents
//! - Fetch-with-retry over a pluggable HTTP transport
//! - Three-tier error taxonomy and circuit thresholds
//! - Persisted per-provider circuit breaker and cooldown
//! - Cross-run call budget ledger and per-endpoint reservations
//! - Canonical JSON, deterministic gzip and atomic artifact writes
//! - Input lineage, health aggregation and run locks
//! - Retention cleanup of mirrors and drift reports

pub mod artifact;
pub mod budget;
pub mod canonical;
pub mod fetch;
pub mod hashing;
pub mod health;
pub mod lineage;
pub mod lock;
pub mod policy;
pub mod provider_state;
pub mod retention;
pub mod run_context;
pub mod store;
pub mod taxonomy;

pub use artifact::{ArtifactError, ArtifactRef, ArtifactWriter, Manifest};
pub use budget::{BudgetError, BudgetLedger, BudgetLedgerStore, PlannedCalls};
pub use fetch::{fetch_with_retry, FetchOutcome, HttpTransport, RetryPolicy, Sleeper};
pub use health::{HealthStatus, HealthStore, StageHealthEntry};
pub use lineage::{build_lineage, validate_lineage, Lineage, LineageValidation};
pub use lock::{LockError, LockGuard, LockKey, LockOutcome, RunLock};
pub use policy::{PolicyError, PolicySet};
pub use provider_state::{FailureReason, ProviderStateManager, SkipDecision, SkipReason};
pub use retention::{run_cleanup, CleanupReport, RetentionError};
pub use run_context::RunContext;
pub use store::StoreError;
pub use taxonomy::{classify, Action, Classification, ErrorKind, ErrorSubtype};
