//! Provider clients: every outbound call goes through one gate.
//!
//! For each request [`ProviderClients::call`] checks, in order:
//! 1. the endpoint is allowed and not blocked by the providers policy
//! 2. the provider's secret is present (missing = recorded skip)
//! 3. the per-endpoint daily reservation and the run budget have room
//! 4. the circuit breaker and cooldown allow a live call
//!
//! The circuit gate comes last because it may spend the one half-open
//! trial call this process gets.
//!
//! It then performs fetch-with-retry, records the outcome in the provider
//! state, consumes budget and appends a usage-ledger line for every call
//! that reached the network.
//!
//! Failed live calls are classified with the error policy. When the newest
//! `circuit_rules.open_after.<kind>` classifications share a kind the
//! provider circuit opens; a half-open circuit closes only after
//! `circuit_rules.close_after_successes` consecutive successes.

use chrono::{NaiveDate, Utc};
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use dataplane_core::budget::{
    estimate_planned_calls, BudgetError, BudgetLedgerStore, EndpointBudget, UsageCollector,
    UsageEvent, UsageLedger,
};
use dataplane_core::fetch::{
    fetch_with_retry, redact, FetchError, FetchOutcome, HttpTransport, Sleeper, Upstream,
};
use dataplane_core::policy::EndpointPermission;
use dataplane_core::provider_state::{
    open_window, CircuitState, FailureDetails, FailureReason, ProviderStateManager, SkipReason,
};
use dataplane_core::store::StoreError;
use dataplane_core::taxonomy::{classify, should_close_circuit, should_open_circuit, Classification};
use dataplane_core::{PolicySet, RunContext};

use crate::config::{secret_env, ProviderConfig, Secrets};

/// Longest response body excerpt carried in an HTTP error.
pub const ERROR_BODY_LIMIT: usize = 240;

/// Outcomes remembered per provider for the circuit thresholds.
const CIRCUIT_HISTORY: usize = 32;

/// Errors from one provider call.
///
/// Only [`ProviderCallError::is_fatal`] errors should end a stage; the rest
/// describe a call that did not produce data and are handled by fallback or
/// degradation.
#[derive(Debug, Error)]
pub enum ProviderCallError {
    #[error("PROVIDER_ENDPOINT_BLOCKED:{provider}:{endpoint}")]
    EndpointBlocked { provider: String, endpoint: String },

    #[error("PROVIDER_ENDPOINT_NOT_ALLOWED:{provider}:{endpoint}")]
    EndpointNotAllowed { provider: String, endpoint: String },

    #[error("MISSING_SECRET:{env}")]
    MissingSecret { provider: String, env: String },

    #[error("PROVIDER_SKIPPED:{provider}:{reason}")]
    Skipped { provider: String, reason: SkipReason },

    #[error("BUDGET_EXHAUSTED:{provider}:{endpoint} endpoint daily limit reached")]
    EndpointLimit { provider: String, endpoint: String },

    #[error("HTTP_{status}:{body}")]
    Http { status: u16, body: String },

    #[error("NETWORK_ERROR:{0}")]
    Network(String),

    #[error("INVALID_RESPONSE:{provider}:{endpoint}: {message}")]
    InvalidResponse {
        provider: String,
        endpoint: String,
        message: String,
    },

    #[error("INVALID_URL:{0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Budget(#[from] BudgetError),
}

impl ProviderCallError {
    /// Run-budget failures end the stage; everything else is per call.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Budget(_))
    }

    /// The provider circuit or cooldown blocked the call, or its secret is
    /// missing. Stages treat these as "provider unavailable".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Skipped { .. } | Self::MissingSecret { .. })
    }
}

/// A provider request before the secret is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderRequest {
    EodhdEod {
        symbol: String,
        from: NaiveDate,
        to: NaiveDate,
    },
    EodhdSplits {
        symbol: String,
        from: NaiveDate,
        to: NaiveDate,
    },
    EodhdDividends {
        symbol: String,
        from: NaiveDate,
        to: NaiveDate,
    },
    EodhdNews {
        symbol: String,
        limit: u32,
    },
    TiingoDaily {
        ticker: String,
        start: NaiveDate,
        end: NaiveDate,
    },
}

impl ProviderRequest {
    pub fn provider(&self) -> &'static str {
        match self {
            Self::TiingoDaily { .. } => "tiingo",
            _ => "eodhd",
        }
    }

    /// Endpoint name as used by the providers policy.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::EodhdEod { .. } => "eod",
            Self::EodhdSplits { .. } => "splits",
            Self::EodhdDividends { .. } => "dividends",
            Self::EodhdNews { .. } => "news",
            Self::TiingoDaily { .. } => "daily",
        }
    }

    /// Query parameter that carries the secret.
    pub fn auth_query(&self) -> &'static str {
        match self {
            Self::TiingoDaily { .. } => "token",
            _ => "api_token",
        }
    }

    fn url(&self, base: &str, secret: &str) -> Result<Url, ProviderCallError> {
        let date = |d: &NaiveDate| d.format("%Y-%m-%d").to_string();
        let (segments, mut query): (Vec<&str>, Vec<(&str, String)>) = match self {
            Self::EodhdEod { symbol, from, to } => (
                vec!["eod", symbol.as_str()],
                vec![("from", date(from)), ("to", date(to)), ("fmt", "json".into())],
            ),
            Self::EodhdSplits { symbol, from, to } => (
                vec!["splits", symbol.as_str()],
                vec![("from", date(from)), ("to", date(to)), ("fmt", "json".into())],
            ),
            Self::EodhdDividends { symbol, from, to } => (
                vec!["div", symbol.as_str()],
                vec![("from", date(from)), ("to", date(to)), ("fmt", "json".into())],
            ),
            Self::EodhdNews { symbol, limit } => (
                vec!["news"],
                vec![("s", symbol.clone()), ("limit", limit.to_string()), ("fmt", "json".into())],
            ),
            Self::TiingoDaily { ticker, start, end } => (
                vec!["daily", ticker.as_str(), "prices"],
                vec![("startDate", date(start)), ("endDate", date(end))],
            ),
        };
        query.push((self.auth_query(), secret.to_string()));

        let mut url = Url::parse(base).map_err(|e| ProviderCallError::InvalidUrl(format!("{base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ProviderCallError::InvalidUrl(base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut().extend_pairs(query.iter());
        Ok(url)
    }
}

/// A successful provider response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: String,
    pub upstream: Upstream,
}

/// Gatekeeper for all provider traffic of one stage run.
pub struct ProviderClients<'a> {
    transport: &'a dyn HttpTransport,
    sleeper: &'a dyn Sleeper,
    config: &'a ProviderConfig,
    secrets: &'a Secrets,
    policies: &'a PolicySet,
    run: &'a RunContext,
    stage: String,
    state: ProviderStateManager,
    budget: BudgetLedgerStore,
    usage: UsageCollector,
    ledger: UsageLedger,
    failures: BTreeMap<String, Vec<Classification>>,
    successes: BTreeMap<String, Vec<bool>>,
}

impl<'a> ProviderClients<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run: &'a RunContext,
        policies: &'a PolicySet,
        transport: &'a dyn HttpTransport,
        sleeper: &'a dyn Sleeper,
        config: &'a ProviderConfig,
        secrets: &'a Secrets,
        stage: &str,
        budget: BudgetLedgerStore,
    ) -> Self {
        let provider_ids: Vec<&str> = policies.providers.providers.keys().map(String::as_str).collect();
        Self {
            transport,
            sleeper,
            config,
            secrets,
            policies,
            run,
            stage: stage.to_string(),
            state: ProviderStateManager::load(run.provider_state_path(), &provider_ids),
            budget,
            usage: UsageCollector::new(),
            ledger: UsageLedger::new(run.usage_ledger_path()),
            failures: BTreeMap::new(),
            successes: BTreeMap::new(),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn has_secret(&self, provider: &str) -> bool {
        self.secrets.has(provider)
    }

    pub fn state(&self) -> &ProviderStateManager {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ProviderStateManager {
        &mut self.state
    }

    pub fn budget(&self) -> &BudgetLedgerStore {
        &self.budget
    }

    pub fn usage(&self) -> &UsageCollector {
        &self.usage
    }

    /// Fail fast unless `planned` calls fit this stage's budget.
    pub fn assert_budget(&self, planned: u64) -> Result<(), BudgetError> {
        let planned = estimate_planned_calls(&self.stage, planned, &self.policies.budget);
        self.budget.assert_budget_before_calls(&planned)
    }

    pub fn save_state(&mut self) -> Result<(), StoreError> {
        self.state.save()
    }

    /// Perform `request` and parse the body as JSON.
    pub fn call_json<T: DeserializeOwned>(&mut self, request: &ProviderRequest) -> Result<T, ProviderCallError> {
        let response = self.call(request)?;
        serde_json::from_str(&response.body).map_err(|e| {
            let provider = request.provider();
            let endpoint = request.endpoint();
            let error = ProviderCallError::InvalidResponse {
                provider: provider.to_string(),
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            };
            self.note_failure(
                provider,
                FailureReason::InvalidResponse,
                FailureDetails::status(response.status),
                &error.to_string(),
            );
            self.usage.record_error(provider, endpoint, FailureReason::InvalidResponse.as_str());
            warn!(provider, endpoint, error = %e, "provider response is not the expected JSON");
            error
        })
    }

    /// Perform `request` through every gate.
    pub fn call(&mut self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderCallError> {
        let provider = request.provider();
        let endpoint = request.endpoint();

        match self.policies.providers.check_endpoint(provider, endpoint) {
            EndpointPermission::Allowed => {}
            EndpointPermission::Blocked => {
                self.usage.record_error(provider, endpoint, "ENDPOINT_BLOCKED");
                return Err(ProviderCallError::EndpointBlocked {
                    provider: provider.to_string(),
                    endpoint: endpoint.to_string(),
                });
            }
            EndpointPermission::NotAllowed => {
                self.usage.record_error(provider, endpoint, "ENDPOINT_NOT_ALLOWED");
                return Err(ProviderCallError::EndpointNotAllowed {
                    provider: provider.to_string(),
                    endpoint: endpoint.to_string(),
                });
            }
        }

        let Some(secret) = self.secrets.get(provider) else {
            self.state.record_skip(provider, SkipReason::MissingSecret, None);
            self.usage.record_error(provider, endpoint, SkipReason::MissingSecret.as_str());
            warn!(provider, endpoint, "secret missing, call skipped");
            return Err(ProviderCallError::MissingSecret {
                provider: provider.to_string(),
                env: secret_env(provider),
            });
        };

        if !EndpointBudget::new(&self.policies.providers).reserve(&mut self.usage, provider, endpoint) {
            self.state.record_skip(provider, SkipReason::BudgetExhausted, None);
            return Err(ProviderCallError::EndpointLimit {
                provider: provider.to_string(),
                endpoint: endpoint.to_string(),
            });
        }
        self.assert_budget(1)?;

        let base = self
            .config
            .base_for(provider)
            .ok_or_else(|| ProviderCallError::InvalidUrl(format!("no base url for {provider}")))?;
        let url = request.url(base, secret)?;

        let decision = self.state.should_skip(provider);
        if decision.skip {
            let reason = decision.reason.unwrap_or(SkipReason::CircuitOpen);
            self.state.record_skip(provider, reason, decision.last_http_status);
            self.usage.record_error(provider, endpoint, reason.as_str());
            info!(provider, endpoint, %reason, "provider skipped");
            return Err(ProviderCallError::Skipped {
                provider: provider.to_string(),
                reason,
            });
        }

        let headers = [("accept", "application/json")];
        debug!(provider, endpoint, url = redact(url.as_str()), "provider call");
        let outcome = fetch_with_retry(self.transport, self.sleeper, url.as_str(), &headers, &self.config.retry);

        let reached_network = outcome.upstream.http_status.is_some();
        let latency_ms = outcome.upstream.latency_ms;
        let bytes_in = outcome.body.len() as u64;
        let result = self.record_outcome(provider, endpoint, outcome);
        if reached_network {
            self.account(request, latency_ms, bytes_in)?;
        }
        result
    }

    /// Budget, usage counters and usage ledger for a call that reached the network.
    fn account(&mut self, request: &ProviderRequest, latency_ms: u64, bytes_in: u64) -> Result<(), ProviderCallError> {
        let provider = request.provider();
        let endpoint = request.endpoint();
        self.usage.record(provider, endpoint, latency_ms, bytes_in);
        self.budget.consume(&self.stage, 1)?;

        let event = UsageEvent {
            at: Utc::now(),
            run_id: self.run.run_id.clone(),
            commit: self.run.commit.clone(),
            stage: self.stage.clone(),
            provider: provider.to_string(),
            endpoint: endpoint.to_string(),
            auth_query: Some(request.auth_query().to_string()),
            calls: 1,
        };
        if let Err(e) = self.ledger.append(&event) {
            warn!(error = %e, "usage ledger append failed");
        }
        Ok(())
    }

    fn record_outcome(
        &mut self,
        provider: &str,
        endpoint: &str,
        outcome: FetchOutcome,
    ) -> Result<ProviderResponse, ProviderCallError> {
        if outcome.ok {
            self.note_success(provider);
            return Ok(ProviderResponse {
                status: outcome.status.unwrap_or(200),
                body: outcome.body,
                upstream: outcome.upstream,
            });
        }

        match (outcome.status, outcome.error) {
            (Some(status), _) => {
                let reason = FailureReason::from_status(status);
                let error = ProviderCallError::Http {
                    status,
                    body: truncate_chars(&outcome.body, ERROR_BODY_LIMIT),
                };
                self.note_failure(
                    provider,
                    reason,
                    FailureDetails {
                        http_status: Some(status),
                        retry_after_secs: outcome.retry_after_secs,
                    },
                    &error.to_string(),
                );
                self.usage.record_error(provider, endpoint, &format!("HTTP_{status}"));
                warn!(provider, endpoint, status, %reason, "provider call failed");
                Err(error)
            }
            (None, error) => {
                let message = match error {
                    Some(FetchError::Transport(e)) => e.to_string(),
                    Some(other) => other.to_string(),
                    None => "unknown".to_string(),
                };
                let error = ProviderCallError::Network(message);
                self.note_failure(
                    provider,
                    FailureReason::NetworkError,
                    FailureDetails::default(),
                    &error.to_string(),
                );
                self.usage
                    .record_error(provider, endpoint, FailureReason::NetworkError.as_str());
                warn!(provider, endpoint, %error, "provider unreachable");
                Err(error)
            }
        }
    }

    /// A half-open circuit closes once the close threshold of consecutive
    /// successes is met; until then each success grants the next trial call.
    fn note_success(&mut self, provider: &str) {
        self.failures.remove(provider);
        let successes = push_bounded(self.successes.entry(provider.to_string()).or_default(), true);
        let closes = should_close_circuit(successes, &self.policies.errors);
        if self.state.circuit_state(provider) == CircuitState::HalfOpen && !closes {
            self.state.record_trial_success(provider);
        } else {
            self.state.record_success(provider);
        }
    }

    /// Provider-state bookkeeping for a failed live call, then the error
    /// policy's open threshold over this run's classified failures.
    fn note_failure(&mut self, provider: &str, reason: FailureReason, details: FailureDetails, message: &str) {
        self.state.record_failure(provider, reason, details);
        push_bounded(self.successes.entry(provider.to_string()).or_default(), false);

        let current = classify(message, &self.policies.errors);
        let history = self.failures.entry(provider.to_string()).or_default();
        let opens = should_open_circuit(history, &current, &self.policies.errors);
        push_bounded(history, current);
        if opens {
            info!(provider, kind = %current.kind, subtype = %current.subtype, "error policy threshold reached");
            self.state.open_circuit(provider, open_window(current.kind));
        }
    }
}

fn push_bounded<T>(history: &mut Vec<T>, item: T) -> &[T] {
    history.push(item);
    if history.len() > CIRCUIT_HISTORY {
        history.remove(0);
    }
    history
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
