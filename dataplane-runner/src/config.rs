//! Runner configuration: provider base URLs, retry knobs and secrets.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use dataplane_core::fetch::RetryPolicy;

pub const EODHD_BASE_URL: &str = "https://eodhd.com/api";
pub const TIINGO_BASE_URL: &str = "https://api.tiingo.com/tiingo";

/// Provider base URLs and per-request retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub eodhd_base: String,
    pub tiingo_base: String,
    pub retry: RetryPolicy,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            eodhd_base: EODHD_BASE_URL.to_string(),
            tiingo_base: TIINGO_BASE_URL.to_string(),
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1000),
                timeout: Duration::from_secs(20),
            },
        }
    }
}

impl ProviderConfig {
    /// Point every provider at one base URL (used by tests).
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            eodhd_base: format!("{base}/eodhd"),
            tiingo_base: format!("{base}/tiingo"),
            ..Self::default()
        }
    }

    pub fn base_for(&self, provider: &str) -> Option<&str> {
        match provider {
            "eodhd" => Some(&self.eodhd_base),
            "tiingo" => Some(&self.tiingo_base),
            _ => None,
        }
    }
}

/// Environment variable holding a provider's API key.
pub fn secret_env(provider: &str) -> String {
    format!("{}_API_KEY", provider.to_ascii_uppercase().replace('-', "_"))
}

/// Provider API keys. Values never appear in `Debug` output or logs.
#[derive(Clone, Default)]
pub struct Secrets {
    keys: BTreeMap<String, String>,
}

impl Secrets {
    pub const PROVIDERS: [&'static str; 2] = ["eodhd", "tiingo"];

    /// Read `EODHD_API_KEY` and `TIINGO_API_KEY`. Blank values count as missing.
    pub fn from_env() -> Self {
        let mut secrets = Self::default();
        for provider in Self::PROVIDERS {
            if let Ok(value) = std::env::var(secret_env(provider)) {
                secrets.insert(provider, value);
            }
        }
        secrets
    }

    pub fn insert(&mut self, provider: &str, key: impl Into<String>) {
        let key = key.into();
        let key = key.trim();
        if key.is_empty() {
            self.keys.remove(provider);
        } else {
            self.keys.insert(provider.to_string(), key.to_string());
        }
    }

    pub fn with(mut self, provider: &str, key: impl Into<String>) -> Self {
        self.insert(provider, key);
        self
    }

    pub fn get(&self, provider: &str) -> Option<&str> {
        self.keys.get(provider).map(String::as_str)
    }

    pub fn has(&self, provider: &str) -> bool {
        self.keys.contains_key(provider)
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys.keys()).finish()
    }
}
