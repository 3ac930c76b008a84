//! Three-tier error taxonomy: transient, permanent, data quality.
//!
//! Classification is by phrasing: provider and pipeline errors carry
//! machine-readable prefixes (`HTTP_503:`, `MISSING_SECRET:`,
//! `PROVIDER_ENDPOINT_BLOCKED:`, ...) and the classifier matches on the
//! lowercased message. Anything it does not recognise is treated as a
//! transient network failure, so the fallback is a retry and never a
//! silent acceptance of bad data.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::policy::ErrorsPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    DataQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSubtype {
    Network,
    Timeout,
    ServerError,
    RateLimited,
    AuthMissing,
    AuthInvalid,
    EndpointBlocked,
    SchemaViolation,
    CoverageGap,
    StaleData,
    AdjustmentError,
}

/// What the caller should do about a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Retry,
    CircuitOpen,
    DiscardBatchUseLastGood,
    MarkDegraded,
    FailStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub subtype: ErrorSubtype,
    pub action: Action,
}

const ALL_SUBTYPES: [ErrorSubtype; 11] = [
    ErrorSubtype::Network,
    ErrorSubtype::Timeout,
    ErrorSubtype::ServerError,
    ErrorSubtype::RateLimited,
    ErrorSubtype::AuthMissing,
    ErrorSubtype::AuthInvalid,
    ErrorSubtype::EndpointBlocked,
    ErrorSubtype::SchemaViolation,
    ErrorSubtype::CoverageGap,
    ErrorSubtype::StaleData,
    ErrorSubtype::AdjustmentError,
];

// Checked in this order: permanent, then data quality, then transient.
const BUILTIN_PHRASES: &[(ErrorSubtype, &[&str])] = &[
    (
        ErrorSubtype::AuthMissing,
        &["missing_secret", "missing api key", "api key missing", "no api key"],
    ),
    (
        ErrorSubtype::AuthInvalid,
        &[
            "unauthorized",
            "forbidden",
            "http_401",
            "http 401",
            "http_403",
            "http 403",
            "invalid api key",
            "auth_invalid",
        ],
    ),
    (
        ErrorSubtype::EndpointBlocked,
        &["endpoint_blocked", "endpoint_not_allowed", "not allowed for this plan"],
    ),
    (
        ErrorSubtype::SchemaViolation,
        &["schema", "invalid_response", "unexpected shape"],
    ),
    (
        ErrorSubtype::CoverageGap,
        &["coverage", "missing rows", "empty_result"],
    ),
    (ErrorSubtype::StaleData, &["stale"]),
    (ErrorSubtype::AdjustmentError, &["adjust"]),
    (ErrorSubtype::Timeout, &["timeout", "timed out", "etimedout"]),
    (
        ErrorSubtype::RateLimited,
        &["429", "rate limit", "rate_limited", "too many requests"],
    ),
    (
        ErrorSubtype::ServerError,
        &[
            "http_5",
            "http 5",
            "server error",
            "bad gateway",
            "service unavailable",
        ],
    ),
    (
        ErrorSubtype::Network,
        &[
            "network",
            "econnreset",
            "econnrefused",
            "enotfound",
            "socket",
            "fetch failed",
            "dns",
            "connection",
        ],
    ),
];

impl ErrorSubtype {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network | Self::Timeout | Self::ServerError | Self::RateLimited => {
                ErrorKind::Transient
            }
            Self::AuthMissing | Self::AuthInvalid | Self::EndpointBlocked => ErrorKind::Permanent,
            Self::SchemaViolation | Self::CoverageGap | Self::StaleData | Self::AdjustmentError => {
                ErrorKind::DataQuality
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::RateLimited => "rate_limited",
            Self::AuthMissing => "auth_missing",
            Self::AuthInvalid => "auth_invalid",
            Self::EndpointBlocked => "endpoint_blocked",
            Self::SchemaViolation => "schema_violation",
            Self::CoverageGap => "coverage_gap",
            Self::StaleData => "stale_data",
            Self::AdjustmentError => "adjustment_error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ALL_SUBTYPES.iter().copied().find(|s| s.name() == name)
    }
}

impl fmt::Display for ErrorSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::DataQuality => "data_quality",
        })
    }
}

/// Map an error message to `{kind, subtype, action}`.
pub fn classify(error: &str, policy: &ErrorsPolicy) -> Classification {
    let message = error.to_lowercase();
    let subtype = match_policy_phrases(&message, policy)
        .or_else(|| match_builtin_phrases(&message))
        .unwrap_or(ErrorSubtype::Network);

    Classification {
        kind: subtype.kind(),
        subtype,
        action: policy.actions.for_subtype(subtype),
    }
}

fn match_policy_phrases(message: &str, policy: &ErrorsPolicy) -> Option<ErrorSubtype> {
    policy.taxonomy.iter().find_map(|(name, phrases)| {
        let subtype = ErrorSubtype::from_name(name)?;
        phrases
            .iter()
            .any(|p| message.contains(&p.to_lowercase()))
            .then_some(subtype)
    })
}

fn match_builtin_phrases(message: &str) -> Option<ErrorSubtype> {
    BUILTIN_PHRASES
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|p| message.contains(p)))
        .map(|(subtype, _)| *subtype)
}

/// True once the newest `N` classifications, `current` included, all share
/// `current`'s kind, where `N` is the policy threshold for that kind.
/// `history` is ordered oldest first and excludes `current`.
pub fn should_open_circuit(
    history: &[Classification],
    current: &Classification,
    policy: &ErrorsPolicy,
) -> bool {
    let threshold = policy.circuit_rules.open_after.threshold(current.kind) as usize;
    if threshold == 0 || history.len() + 1 < threshold {
        return false;
    }
    history
        .iter()
        .rev()
        .take(threshold - 1)
        .all(|c| c.kind == current.kind)
}

/// True once the newest `M` attempts were all successes
/// (`M = close_after_successes`). `success_history` is oldest first.
pub fn should_close_circuit(success_history: &[bool], policy: &ErrorsPolicy) -> bool {
    let needed = policy.circuit_rules.close_after_successes as usize;
    if success_history.len() < needed {
        return false;
    }
    success_history.iter().rev().take(needed).all(|ok| *ok)
}
