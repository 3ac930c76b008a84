//! Static, versioned policy documents.
//!
//! Policies live under `<root>/policies/`, one file per concern:
//! `budget`, `providers`, `errors`, `build`, `retention`. Each is read as
//! `<name>.toml` when present, otherwise `<name>.json`. Documents are parsed
//! into strongly-typed structs that reject unknown keys, then validated;
//! any failure aborts loading. A loaded [`PolicySet`] is never mutated.

pub mod budget;
pub mod build;
pub mod errors;
pub mod providers;
pub mod retention;

pub use budget::{BudgetPeriod, BudgetPolicy};
pub use build::{BuildLimits, BuildPolicy};
pub use errors::{CircuitRules, ErrorActions, ErrorsPolicy, OpenAfter};
pub use providers::{EndpointLimit, EndpointPermission, ProviderPolicy, ProvidersPolicy, RoutingPolicy};
pub use retention::{RetentionPolicy, RetentionSafeguards, RetentionStrategy};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::{canonical, hashing};

/// Relative directory holding the policy documents.
pub const POLICY_DIR: &str = "policies";

/// Errors from loading policy documents.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("POLICY_MISSING:{name} (looked for {name}.toml / {name}.json in {dir})")]
    Missing { name: String, dir: PathBuf },

    #[error("POLICY_UNREADABLE:{path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("POLICY_PARSE_ERROR:{path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("POLICY_INVALID:{name}: {}", failures.join("; "))]
    Invalid { name: String, failures: Vec<String> },
}

/// A policy document type: knows its file stem and how to validate itself.
pub trait PolicyDocument: DeserializeOwned + Serialize {
    /// File stem under the policy directory.
    const NAME: &'static str;

    /// Shape checks beyond what deserialization enforces. Empty = valid.
    fn validate(&self) -> Vec<String>;
}

/// Read, parse and validate one policy document from `dir`.
pub fn load_document<P: PolicyDocument>(dir: &Path) -> Result<P, PolicyError> {
    let toml_path = dir.join(format!("{}.toml", P::NAME));
    let json_path = dir.join(format!("{}.json", P::NAME));

    let doc: P = if toml_path.is_file() {
        let raw = read(&toml_path)?;
        toml::from_str(&raw).map_err(|e| PolicyError::Parse {
            path: toml_path.clone(),
            message: e.to_string(),
        })?
    } else if json_path.is_file() {
        let raw = read(&json_path)?;
        serde_json::from_str(&raw).map_err(|e| PolicyError::Parse {
            path: json_path.clone(),
            message: e.to_string(),
        })?
    } else {
        return Err(PolicyError::Missing {
            name: P::NAME.to_string(),
            dir: dir.to_path_buf(),
        });
    };

    let failures = doc.validate();
    if !failures.is_empty() {
        return Err(PolicyError::Invalid {
            name: P::NAME.to_string(),
            failures,
        });
    }
    Ok(doc)
}

fn read(path: &Path) -> Result<String, PolicyError> {
    std::fs::read_to_string(path).map_err(|e| PolicyError::Unreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// All policy documents needed by a run.
#[derive(Debug, Clone, Serialize)]
pub struct PolicySet {
    pub budget: BudgetPolicy,
    pub providers: ProvidersPolicy,
    pub errors: ErrorsPolicy,
    pub build: BuildPolicy,
    pub retention: RetentionPolicy,
}

impl PolicySet {
    /// Load every policy from `<root>/policies`.
    pub fn load(root: &Path) -> Result<Self, PolicyError> {
        Self::load_dir(&root.join(POLICY_DIR))
    }

    /// Load every policy from an explicit directory.
    pub fn load_dir(dir: &Path) -> Result<Self, PolicyError> {
        let set = Self {
            budget: load_document(dir)?,
            providers: load_document(dir)?,
            errors: load_document(dir)?,
            build: load_document(dir)?,
            retention: load_document(dir)?,
        };
        tracing::debug!(dir = %dir.display(), "policies loaded");
        Ok(set)
    }

    /// Check every document and collect all failures instead of stopping at
    /// the first one.
    pub fn check_dir(dir: &Path) -> Vec<String> {
        let mut failures = Vec::new();
        collect::<BudgetPolicy>(dir, &mut failures);
        collect::<ProvidersPolicy>(dir, &mut failures);
        collect::<ErrorsPolicy>(dir, &mut failures);
        collect::<BuildPolicy>(dir, &mut failures);
        collect::<RetentionPolicy>(dir, &mut failures);
        failures
    }

    /// SHA-256 over the canonical form of all documents.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let text = canonical::to_canonical_string(self)?;
        Ok(hashing::sha256_hex(text.as_bytes()))
    }
}

fn collect<P: PolicyDocument>(dir: &Path, failures: &mut Vec<String>) {
    if let Err(e) = load_document::<P>(dir) {
        failures.push(e.to_string());
    }
}
