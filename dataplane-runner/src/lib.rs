//! Dataplane Runner: provider clients, stage runner and pipeline stages.
//!
//! This crate builds on `dataplane-core` to provide:
//! - Provider configuration and secrets
//! - Gated provider clients (endpoint policy, circuit, budget, usage)
//! - The mapped symbol universe and local bar mirror
//! - A stage runner with lock, budget, provider state and health bookkeeping
//! - The dp0/dp1/dp2/dp3/dp5 pipeline stages

pub mod config;
pub mod providers;
pub mod runner;
pub mod stages;
pub mod universe;

pub use config::{ProviderConfig, Secrets};
pub use providers::{ProviderCallError, ProviderClients, ProviderRequest, ProviderResponse};
pub use runner::{Stage, StageContext, StageError, StageOutcome, StageReport, StageRunner};
pub use stages::{AdjustedSeries, CorporateActions, EodSnapshot, NewsSignals, UniverseSync};
pub use universe::{Universe, UniverseEntry, UniverseError};
