//! Per-provider request accounting.
//!
//! [`UsageCollector`] counts requests and errors in memory for the current
//! process. [`EndpointBudget`] checks those counts against the daily limits
//! in the providers policy and answers `false` instead of failing, so a
//! caller can take a degraded path. [`UsageLedger`] appends one JSON line per
//! billed call to `mirrors/ops/usage-ledger.v3.ndjson`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use crate::policy::ProvidersPolicy;
use crate::store::StoreError;

pub const BUDGET_EXHAUSTED: &str = "BUDGET_EXHAUSTED";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageCounters {
    pub requests: u64,
    pub latency_ms: u64,
    pub bytes_in: u64,
    pub errors: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderUsage {
    #[serde(flatten)]
    pub totals: UsageCounters,
    pub endpoints: BTreeMap<String, UsageCounters>,
}

/// In-memory request and error counters for this process.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageCollector {
    providers: BTreeMap<String, ProviderUsage>,
}

impl UsageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, provider: &str, endpoint: &str, latency_ms: u64, bytes_in: u64) {
        let usage = self.providers.entry(provider.to_string()).or_default();
        for counters in [
            &mut usage.totals,
            usage.endpoints.entry(endpoint.to_string()).or_default(),
        ] {
            counters.requests += 1;
            counters.latency_ms += latency_ms;
            counters.bytes_in += bytes_in;
        }
    }

    pub fn record_error(&mut self, provider: &str, endpoint: &str, reason: &str) {
        let usage = self.providers.entry(provider.to_string()).or_default();
        for counters in [
            &mut usage.totals,
            usage.endpoints.entry(endpoint.to_string()).or_default(),
        ] {
            *counters.errors.entry(reason.to_string()).or_insert(0) += 1;
        }
    }

    pub fn provider(&self, provider: &str) -> Option<&ProviderUsage> {
        self.providers.get(provider)
    }

    pub fn requests(&self, provider: &str, endpoint: Option<&str>) -> u64 {
        let Some(usage) = self.providers.get(provider) else {
            return 0;
        };
        match endpoint {
            Some(ep) => usage.endpoints.get(ep).map_or(0, |c| c.requests),
            None => usage.totals.requests,
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.providers.values().map(|u| u.totals.requests).sum()
    }
}

/// Secondary per-(provider, endpoint) reservation check.
pub struct EndpointBudget<'a> {
    policy: &'a ProvidersPolicy,
}

impl<'a> EndpointBudget<'a> {
    pub fn new(policy: &'a ProvidersPolicy) -> Self {
        Self { policy }
    }

    /// Requests already counted against the limit that governs `endpoint`:
    /// the endpoint's own count when it has an override, else the provider's.
    fn current(&self, usage: &UsageCollector, provider: &str, endpoint: &str) -> u64 {
        let has_override = self
            .policy
            .providers
            .get(provider)
            .and_then(|p| p.endpoints.get(endpoint))
            .and_then(|e| e.daily_requests)
            .is_some();
        if has_override {
            usage.requests(provider, Some(endpoint))
        } else {
            usage.requests(provider, None)
        }
    }

    /// True when another call fits. On denial records `BUDGET_EXHAUSTED`
    /// against the endpoint and returns false.
    pub fn reserve(&self, usage: &mut UsageCollector, provider: &str, endpoint: &str) -> bool {
        let Some(limit) = self.policy.daily_limit(provider, endpoint) else {
            return true;
        };
        if self.current(usage, provider, endpoint) >= limit {
            usage.record_error(provider, endpoint, BUDGET_EXHAUSTED);
            tracing::warn!(provider, endpoint, limit, "endpoint daily limit reached");
            return false;
        }
        true
    }

    /// Calls left under the governing limit; `None` = unlimited.
    pub fn remaining(&self, usage: &UsageCollector, provider: &str, endpoint: &str) -> Option<u64> {
        let limit = self.policy.daily_limit(provider, endpoint)?;
        Some(limit.saturating_sub(self.current(usage, provider, endpoint)))
    }
}

/// One billed provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub at: DateTime<Utc>,
    pub run_id: String,
    pub commit: String,
    pub stage: String,
    pub provider: String,
    pub endpoint: String,
    /// Query parameter that carried the secret, if any.
    pub auth_query: Option<String>,
    pub calls: u64,
}

/// Append-only JSONL usage ledger.
pub struct UsageLedger {
    path: PathBuf,
}

impl UsageLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &UsageEvent) -> Result<(), StoreError> {
        let line = crate::canonical::to_canonical_string(event)
            .map_err(|e| StoreError::json(&self.path, e))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        writeln!(file, "{line}")
            .and_then(|_| file.flush())
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Read every event. Malformed lines are skipped.
    pub fn read_all(&self) -> io::Result<Vec<UsageEvent>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut events = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(event) = serde_json::from_str(&line) {
                events.push(event);
            }
        }
        Ok(events)
    }
}
