//! Provider permissions and per-endpoint request limits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::PolicyDocument;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidersPolicy {
    pub schema_version: String,
    #[serde(default)]
    pub policy: RoutingPolicy,
    pub providers: BTreeMap<String, ProviderPolicy>,
}

/// Which provider is primary for equities and which ones back it up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub equities_primary: Option<String>,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderPolicy {
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,
    #[serde(default)]
    pub blocked_endpoints: Vec<String>,
    /// Provider-wide daily request limit for the secondary reservation check.
    #[serde(default)]
    pub daily_requests: Option<u64>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointLimit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointLimit {
    #[serde(default)]
    pub daily_requests: Option<u64>,
}

/// Outcome of checking an endpoint against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPermission {
    Allowed,
    Blocked,
    NotAllowed,
}

impl ProvidersPolicy {
    pub fn check_endpoint(&self, provider: &str, endpoint: &str) -> EndpointPermission {
        let Some(cfg) = self.providers.get(provider) else {
            return EndpointPermission::NotAllowed;
        };
        if cfg.blocked_endpoints.iter().any(|e| e == endpoint) {
            EndpointPermission::Blocked
        } else if cfg.allowed_endpoints.iter().any(|e| e == endpoint) {
            EndpointPermission::Allowed
        } else {
            EndpointPermission::NotAllowed
        }
    }

    /// Daily request limit for (provider, endpoint): the endpoint override
    /// when set, else the provider-wide limit. `None` = unlimited.
    pub fn daily_limit(&self, provider: &str, endpoint: &str) -> Option<u64> {
        let cfg = self.providers.get(provider)?;
        cfg.endpoints
            .get(endpoint)
            .and_then(|e| e.daily_requests)
            .or(cfg.daily_requests)
    }
}

impl PolicyDocument for ProvidersPolicy {
    const NAME: &'static str = "providers";

    fn validate(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.providers.is_empty() {
            failures.push("providers.providers must not be empty".to_string());
        }
        for (id, cfg) in &self.providers {
            for endpoint in &cfg.allowed_endpoints {
                if cfg.blocked_endpoints.contains(endpoint) {
                    failures.push(format!(
                        "providers.{id}: endpoint '{endpoint}' is both allowed and blocked"
                    ));
                }
            }
        }
        if let Some(primary) = &self.policy.equities_primary {
            if !self.providers.contains_key(primary) {
                failures.push(format!(
                    "providers.policy.equities_primary '{primary}' is not a configured provider"
                ));
            }
        }
        for fallback in &self.policy.fallbacks {
            if !self.providers.contains_key(fallback) {
                failures.push(format!(
                    "providers.policy.fallbacks: '{fallback}' is not a configured provider"
                ));
            }
        }
        failures
    }
}
