//! System health document at `public/data/v3/system/health.json`.
//!
//! Stages patch the document on completion; it is never replaced
//! wholesale. Objects merge key by key, arrays and scalars overwrite. Every
//! write stamps the run identity under `meta`.

use serde::{Deserialize, Serialize};
use serde_json::map::Entry;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tracing::debug;

use crate::run_context::RunContext;
use crate::store::{self, StoreError};

pub const HEALTH_SCHEMA: &str = "rv.health.v3";

/// Recursively merge `patch` into `target`.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.entry(key.clone()) {
                    Entry::Occupied(mut slot) => deep_merge(slot.get_mut(), value),
                    Entry::Vacant(slot) => {
                        slot.insert(value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }
}

/// One stage's contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageHealthEntry {
    pub status: HealthStatus,
    pub stale: bool,
    pub partial: bool,
    pub coverage: Value,
    pub manifest: Option<String>,
    pub reason: Option<String>,
    pub last_run: String,
}

impl StageHealthEntry {
    pub fn new(status: HealthStatus, ctx: &RunContext) -> Self {
        Self {
            status,
            stale: false,
            partial: false,
            coverage: Value::Object(Map::new()),
            manifest: None,
            reason: None,
            last_run: ctx.generated_at_iso(),
        }
    }

    /// Entry for a stage that failed before producing output.
    pub fn failed(reason: impl Into<String>, ctx: &RunContext) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(HealthStatus::Error, ctx)
        }
    }
}

/// Patch placing `entry` under `stages.<stage_id>`, merged with `system`.
pub fn stage_patch(stage_id: &str, entry: &StageHealthEntry, system: Value) -> Value {
    json!({
        "system": system,
        "stages": { stage_id: entry },
    })
}

pub struct HealthStore {
    path: PathBuf,
}

impl HealthStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_run(ctx: &RunContext) -> Self {
        Self::new(ctx.health_path())
    }

    /// Current document; a missing or unreadable file reads as `{}`.
    pub fn read(&self) -> Value {
        store::read_json_lenient::<Value>(&self.path)
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// Merge `patch`, stamp `meta`, write atomically. Returns the new document.
    pub fn update(&self, ctx: &RunContext, patch: &Value) -> Result<Value, StoreError> {
        let mut doc = self.read();
        deep_merge(&mut doc, patch);
        deep_merge(
            &mut doc,
            &json!({
                "schema": HEALTH_SCHEMA,
                "meta": {
                    "generated_at": ctx.generated_at_iso(),
                    "run_id": ctx.run_id,
                    "commit": ctx.commit,
                    "policy_commit": ctx.policy_commit,
                }
            }),
        );
        store::write_json_atomic(&self.path, &doc)?;
        debug!(path = %self.path.display(), "health updated");
        Ok(doc)
    }
}
