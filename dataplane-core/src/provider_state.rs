//! Per-provider circuit breaker and rate-limit cooldown, persisted across runs.
//!
//! One document keyed by provider id lives at
//! `mirrors/ops/provider-state.json`. It is loaded at the start of a run,
//! mutated by call outcomes, and saved at the end. Entries are created
//! lazily and never deleted.
//!
//! The half-open trial call allowance is tracked in memory only: each
//! manager (one per process) grants a provider whose open window has
//! elapsed exactly one trial call, even if a previous process already spent
//! its own. Callers applying the error policy's close threshold report a
//! successful trial call that is not yet enough to close with
//! [`ProviderStateManager::record_trial_success`], which grants the next one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::store::{self, StoreError};
use crate::taxonomy::ErrorKind;

pub const STATE_SCHEMA_VERSION: &str = "v1";

/// Consecutive-count threshold for the auth and server-error breakers.
const OPEN_THRESHOLD: u32 = 3;
const UNAUTHORIZED_OPEN_MINUTES: i64 = 60;
const SERVER_ERROR_OPEN_MINUTES: i64 = 15;
const HALF_OPEN_FAILURE_OPEN_MINUTES: i64 = 15;

/// Open window when an error-policy threshold trips: permanent failures
/// wait as long as repeated auth failures, everything else as long as
/// server errors.
pub fn open_window(kind: ErrorKind) -> Duration {
    match kind {
        ErrorKind::Permanent => Duration::minutes(UNAUTHORIZED_OPEN_MINUTES),
        ErrorKind::Transient | ErrorKind::DataQuality => Duration::minutes(SERVER_ERROR_OPEN_MINUTES),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    HalfOpen,
    Open,
}

/// Why a live call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    RateLimited,
    Unauthorized,
    ProviderHttpError,
    NetworkError,
    InvalidResponse,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ProviderHttpError => "PROVIDER_HTTP_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::InvalidResponse => "INVALID_RESPONSE",
        }
    }

    /// Reason for a completed non-2xx response.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            401 | 403 => Self::Unauthorized,
            _ => Self::ProviderHttpError,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    RateLimited,
    CircuitOpen,
    MissingSecret,
    BudgetExhausted,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::MissingSecret => "MISSING_SECRET",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional detail attached to a failure or skip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureDetails {
    pub http_status: Option<u16>,
    pub retry_after_secs: Option<u64>,
}

impl FailureDetails {
    pub fn status(http_status: u16) -> Self {
        Self {
            http_status: Some(http_status),
            retry_after_secs: None,
        }
    }
}

/// Persisted state for one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderStateEntry {
    pub circuit_state: CircuitState,
    pub open_until: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Failure counters by reason, reset on success.
    pub failures: BTreeMap<String, u32>,
    /// Last failure/skip reason, or `OK`.
    pub last_reason: Option<String>,
    pub last_http_status: Option<u16>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ProviderStateEntry {
    fn failure_count(&self, reason: FailureReason) -> u32 {
        self.failures.get(reason.as_str()).copied().unwrap_or(0)
    }

    fn open_for(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.circuit_state = CircuitState::Open;
        self.open_until = Some(now + duration);
    }
}

/// The whole provider-state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStateDocument {
    pub schema_version: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderStateEntry>,
}

impl ProviderStateDocument {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION.to_string(),
            updated_at: now,
            providers: BTreeMap::new(),
        }
    }
}

/// Result of [`ProviderStateManager::should_skip`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipDecision {
    pub skip: bool,
    pub reason: Option<SkipReason>,
    pub open_until: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_reason: Option<String>,
    pub last_http_status: Option<u16>,
}

impl SkipDecision {
    fn allow() -> Self {
        Self {
            skip: false,
            reason: None,
            open_until: None,
            cooldown_until: None,
            last_reason: None,
            last_http_status: None,
        }
    }

    fn skip(reason: SkipReason, entry: &ProviderStateEntry) -> Self {
        Self {
            skip: true,
            reason: Some(reason),
            open_until: entry.open_until,
            cooldown_until: entry.cooldown_until,
            last_reason: entry.last_reason.clone(),
            last_http_status: entry.last_http_status,
        }
    }
}

/// Owns the loaded provider-state document for one process.
#[derive(Debug)]
pub struct ProviderStateManager {
    path: PathBuf,
    doc: ProviderStateDocument,
    half_open_used: BTreeSet<String>,
}

impl ProviderStateManager {
    /// Load the document at `path`, seeding entries for `provider_ids`.
    /// A missing or unreadable document starts empty.
    pub fn load(path: impl Into<PathBuf>, provider_ids: &[&str]) -> Self {
        let path = path.into();
        let doc = store::read_json_lenient::<ProviderStateDocument>(&path)
            .unwrap_or_else(|| ProviderStateDocument::empty(Utc::now()));
        let mut manager = Self {
            path,
            doc,
            half_open_used: BTreeSet::new(),
        };
        for id in provider_ids {
            manager.ensure(id);
        }
        manager
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &ProviderStateDocument {
        &self.doc
    }

    pub fn entry(&self, provider: &str) -> Option<&ProviderStateEntry> {
        self.doc.providers.get(provider)
    }

    /// Entry for `provider`, created closed if absent.
    pub fn ensure(&mut self, provider: &str) -> &mut ProviderStateEntry {
        self.doc.providers.entry(provider.to_string()).or_default()
    }

    pub fn should_skip(&mut self, provider: &str) -> SkipDecision {
        self.should_skip_at(provider, Utc::now())
    }

    /// Gate a live call. Cooldown wins over an open circuit; an open circuit
    /// whose window elapsed moves to half-open and grants this process one
    /// trial call.
    pub fn should_skip_at(&mut self, provider: &str, now: DateTime<Utc>) -> SkipDecision {
        let entry = self.doc.providers.entry(provider.to_string()).or_default();

        if entry.cooldown_until.is_some_and(|until| now < until) {
            return SkipDecision::skip(SkipReason::RateLimited, entry);
        }

        if entry.circuit_state == CircuitState::Open {
            if entry.open_until.is_some_and(|until| now < until) {
                return SkipDecision::skip(SkipReason::CircuitOpen, entry);
            }
            info!(provider, "circuit half-open, allowing one trial call");
            entry.circuit_state = CircuitState::HalfOpen;
            entry.open_until = None;
            self.half_open_used.remove(provider);
        }

        if entry.circuit_state == CircuitState::HalfOpen {
            if self.half_open_used.contains(provider) {
                return SkipDecision::skip(SkipReason::CircuitOpen, entry);
            }
            self.half_open_used.insert(provider.to_string());
        }

        SkipDecision::allow()
    }

    pub fn record_success(&mut self, provider: &str) {
        self.record_success_at(provider, Utc::now());
    }

    /// Clears counters, cooldown and open window; closes the circuit.
    pub fn record_success_at(&mut self, provider: &str, now: DateTime<Utc>) {
        let entry = self.ensure(provider);
        if entry.circuit_state != CircuitState::Closed {
            info!(provider, "circuit closed after successful call");
        }
        *entry = ProviderStateEntry {
            last_reason: Some("OK".to_string()),
            last_seen: Some(now),
            ..ProviderStateEntry::default()
        };
    }

    /// A successful half-open trial call that is not yet enough to close the
    /// circuit. The circuit stays half-open and this process may try again.
    pub fn record_trial_success(&mut self, provider: &str) {
        self.record_trial_success_at(provider, Utc::now());
    }

    pub fn record_trial_success_at(&mut self, provider: &str, now: DateTime<Utc>) {
        let entry = self.ensure(provider);
        entry.last_reason = Some("OK".to_string());
        entry.last_http_status = None;
        entry.last_seen = Some(now);
        self.half_open_used.remove(provider);
        info!(provider, "half-open trial call succeeded, circuit stays half-open");
    }

    pub fn circuit_state(&self, provider: &str) -> CircuitState {
        self.entry(provider).map(|e| e.circuit_state).unwrap_or_default()
    }

    /// Open the circuit for `window` unless it is already open.
    pub fn open_circuit(&mut self, provider: &str, window: Duration) {
        self.open_circuit_at(provider, window, Utc::now());
    }

    pub fn open_circuit_at(&mut self, provider: &str, window: Duration, now: DateTime<Utc>) {
        let entry = self.ensure(provider);
        if entry.circuit_state == CircuitState::Open {
            return;
        }
        entry.open_for(now, window);
        warn!(provider, minutes = window.num_minutes(), "circuit opened by error policy threshold");
    }

    pub fn record_failure(&mut self, provider: &str, reason: FailureReason, details: FailureDetails) {
        self.record_failure_at(provider, reason, details, Utc::now());
    }

    pub fn record_failure_at(
        &mut self,
        provider: &str,
        reason: FailureReason,
        details: FailureDetails,
        now: DateTime<Utc>,
    ) {
        let entry = self.ensure(provider);
        entry.last_seen = Some(now);
        *entry.failures.entry(reason.as_str().to_string()).or_insert(0) += 1;
        entry.last_reason = Some(reason.as_str().to_string());
        entry.last_http_status = details.http_status;

        if reason == FailureReason::RateLimited {
            if let Some(secs) = details.retry_after_secs {
                entry.cooldown_until = Some(now + Duration::seconds(secs as i64));
            }
        }

        if reason == FailureReason::Unauthorized
            && entry.failure_count(reason) >= OPEN_THRESHOLD
        {
            entry.open_for(now, Duration::minutes(UNAUTHORIZED_OPEN_MINUTES));
            warn!(provider, %reason, "circuit opened for 1h");
        }

        if reason == FailureReason::ProviderHttpError
            && details.http_status.is_some_and(|s| s >= 500)
            && entry.failure_count(reason) >= OPEN_THRESHOLD
        {
            entry.open_for(now, Duration::minutes(SERVER_ERROR_OPEN_MINUTES));
            warn!(provider, %reason, "circuit opened for 15m");
        }

        if entry.circuit_state == CircuitState::HalfOpen {
            entry.open_for(now, Duration::minutes(HALF_OPEN_FAILURE_OPEN_MINUTES));
            warn!(provider, %reason, "half-open trial call failed, circuit re-opened");
        }
    }

    pub fn record_skip(&mut self, provider: &str, reason: SkipReason, http_status: Option<u16>) {
        self.record_skip_at(provider, reason, http_status, Utc::now());
    }

    /// Bookkeeping for a call that was never attempted. Counters untouched.
    pub fn record_skip_at(
        &mut self,
        provider: &str,
        reason: SkipReason,
        http_status: Option<u16>,
        now: DateTime<Utc>,
    ) {
        let entry = self.ensure(provider);
        entry.last_seen = Some(now);
        entry.last_reason = Some(reason.as_str().to_string());
        entry.last_http_status = http_status;
    }

    pub fn save(&mut self) -> Result<(), StoreError> {
        self.save_at(Utc::now())
    }

    pub fn save_at(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.doc.updated_at = now;
        store::write_json_atomic(&self.path, &self.doc)
    }
}
