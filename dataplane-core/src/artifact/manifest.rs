//! Per-stage manifest: run identity, quality, lineage summary, artifacts.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ArtifactRef;
use crate::run_context::RunContext;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMeta {
    pub schema: String,
    pub generated_at: String,
    pub run_id: String,
    pub commit: String,
    pub policy_commit: String,
    pub quality: Value,
    pub lineage: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub meta: ManifestMeta,
    pub artifacts: Vec<ArtifactRef>,
}

impl Manifest {
    pub fn builder(schema: impl Into<String>, ctx: &RunContext) -> ManifestBuilder {
        ManifestBuilder {
            schema: schema.into(),
            generated_at: ctx.generated_at_iso(),
            run_id: ctx.run_id.clone(),
            commit: ctx.commit.clone(),
            policy_commit: ctx.policy_commit.clone(),
            quality: Map::new(),
            lineage: Value::Object(Map::new()),
        }
    }

    pub fn artifact(&self, path: &str) -> Option<&ArtifactRef> {
        self.artifacts.iter().find(|a| a.path == path)
    }
}

/// Accumulates quality fields; [`ManifestBuilder::build`] takes the list of
/// artifacts actually written.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    schema: String,
    generated_at: String,
    run_id: String,
    commit: String,
    policy_commit: String,
    quality: Map<String, Value>,
    lineage: Value,
}

impl ManifestBuilder {
    pub fn quality(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.quality.insert(key.to_string(), value.into());
        self
    }

    pub fn lineage(mut self, lineage: Value) -> Self {
        self.lineage = lineage;
        self
    }

    pub fn build(self, artifacts: &[ArtifactRef]) -> Manifest {
        Manifest {
            meta: ManifestMeta {
                schema: self.schema,
                generated_at: self.generated_at,
                run_id: self.run_id,
                commit: self.commit,
                policy_commit: self.policy_commit,
                quality: Value::Object(self.quality),
                lineage: self.lineage,
            },
            artifacts: artifacts.to_vec(),
        }
    }
}
