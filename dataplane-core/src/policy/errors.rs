//! Error-to-action table and circuit thresholds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::PolicyDocument;
use crate::taxonomy::{Action, ErrorKind, ErrorSubtype};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorsPolicy {
    pub schema_version: String,
    pub circuit_rules: CircuitRules,
    pub actions: ErrorActions,
    /// Extra lowercase phrases per subtype name, checked before the
    /// built-in phrasing.
    #[serde(default)]
    pub taxonomy: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitRules {
    pub open_after: OpenAfter,
    /// Consecutive successes needed to close a circuit.
    pub close_after_successes: u32,
}

/// Consecutive same-kind classifications that open a circuit. Zero disables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAfter {
    pub transient: u32,
    pub permanent: u32,
    pub data_quality: u32,
}

impl OpenAfter {
    pub fn threshold(&self, kind: ErrorKind) -> u32 {
        match kind {
            ErrorKind::Transient => self.transient,
            ErrorKind::Permanent => self.permanent,
            ErrorKind::DataQuality => self.data_quality,
        }
    }
}

/// Action per non-transient subtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorActions {
    pub auth_missing: Action,
    pub auth_invalid: Action,
    pub endpoint_blocked: Action,
    pub schema_violation: Action,
    pub coverage_gap: Action,
    pub stale_data: Action,
    pub adjustment_error: Action,
}

impl ErrorActions {
    /// Configured action for a subtype. Transient subtypes always retry.
    pub fn for_subtype(&self, subtype: ErrorSubtype) -> Action {
        match subtype {
            ErrorSubtype::Network
            | ErrorSubtype::Timeout
            | ErrorSubtype::ServerError
            | ErrorSubtype::RateLimited => Action::Retry,
            ErrorSubtype::AuthMissing => self.auth_missing,
            ErrorSubtype::AuthInvalid => self.auth_invalid,
            ErrorSubtype::EndpointBlocked => self.endpoint_blocked,
            ErrorSubtype::SchemaViolation => self.schema_violation,
            ErrorSubtype::CoverageGap => self.coverage_gap,
            ErrorSubtype::StaleData => self.stale_data,
            ErrorSubtype::AdjustmentError => self.adjustment_error,
        }
    }
}

impl PolicyDocument for ErrorsPolicy {
    const NAME: &'static str = "errors";

    fn validate(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.circuit_rules.close_after_successes == 0 {
            failures.push("errors.circuit_rules.close_after_successes must be positive".into());
        }
        let permanent = [
            ("auth_missing", self.actions.auth_missing),
            ("auth_invalid", self.actions.auth_invalid),
            ("endpoint_blocked", self.actions.endpoint_blocked),
        ];
        for (name, action) in permanent {
            if action == Action::Retry {
                failures.push(format!(
                    "errors.actions.{name}: permanent failures must not retry"
                ));
            }
        }
        for (subtype, phrases) in &self.taxonomy {
            if ErrorSubtype::from_name(subtype).is_none() {
                failures.push(format!("errors.taxonomy: unknown subtype '{subtype}'"));
            }
            if phrases.iter().any(|p| p.trim().is_empty()) {
                failures.push(format!("errors.taxonomy.{subtype}: empty phrase"));
            }
        }
        failures
    }
}
