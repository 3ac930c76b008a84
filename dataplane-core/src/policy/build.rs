//! Publish-tree ceilings.

use serde::{Deserialize, Serialize};

use super::PolicyDocument;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildPolicy {
    pub schema_version: String,
    #[serde(default)]
    pub limits: BuildLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildLimits {
    #[serde(default = "default_max_files")]
    pub max_file_count_per_publish_folder: usize,
    #[serde(default = "default_max_bytes")]
    pub max_artifact_size_bytes: u64,
}

fn default_max_files() -> usize {
    5000
}

fn default_max_bytes() -> u64 {
    50 * 1024 * 1024
}

impl Default for BuildLimits {
    fn default() -> Self {
        Self {
            max_file_count_per_publish_folder: default_max_files(),
            max_artifact_size_bytes: default_max_bytes(),
        }
    }
}

impl PolicyDocument for BuildPolicy {
    const NAME: &'static str = "build";

    fn validate(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.limits.max_file_count_per_publish_folder == 0 {
            failures.push("build.limits.max_file_count_per_publish_folder must be positive".into());
        }
        if self.limits.max_artifact_size_bytes == 0 {
            failures.push("build.limits.max_artifact_size_bytes must be positive".into());
        }
        failures
    }
}
