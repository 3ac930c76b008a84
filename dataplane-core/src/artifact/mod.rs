//! Deterministic artifact writing.
//!
//! Every artifact is canonical JSON (keys sorted, compact, newline
//! terminated), canonical NDJSON, or a deterministic gzip of either. Writes
//! are atomic and return `{path, sha256, bytes}` where `path` is relative to
//! the run root and the hash/size describe the bytes on disk.

pub mod gzip;
pub mod manifest;

pub use gzip::{gunzip, gzip_deterministic, read_gzip_ndjson};
pub use manifest::{Manifest, ManifestBuilder, ManifestMeta};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::canonical;
use crate::hashing;
use crate::policy::BuildPolicy;
use crate::store::{self, StoreError};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ARTIFACT_SERIALIZE:{path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("ARTIFACT_COMPRESS:{path}: {source}")]
    Compress {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("BUILD_LIMIT_EXCEEDED:file_count>{max} in {dir}")]
    FileCount { max: usize, dir: String },

    #[error("BUILD_LIMIT_EXCEEDED:file_size>{max} for {path}")]
    FileSize { max: u64, path: String },

    #[error("BUILD_LIMIT_SCAN:{dir}: {source}")]
    Scan {
        dir: String,
        #[source]
        source: std::io::Error,
    },
}

/// A written artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Root-relative, `/`-separated.
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes artifacts under a run root and remembers what it wrote, so the
/// manifest lists exactly the files produced.
#[derive(Debug)]
pub struct ArtifactWriter {
    root: PathBuf,
    written: Vec<ArtifactRef>,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            written: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Artifacts written so far, in write order.
    pub fn written(&self) -> &[ArtifactRef] {
        &self.written
    }

    pub fn write_json<T: Serialize + ?Sized>(&mut self, rel: &str, doc: &T) -> Result<ArtifactRef, ArtifactError> {
        let bytes = canonical::to_canonical_document(doc).map_err(|e| serialize_err(rel, e))?;
        self.write_bytes(rel, &bytes)
    }

    pub fn write_ndjson<T: Serialize>(&mut self, rel: &str, rows: &[T]) -> Result<ArtifactRef, ArtifactError> {
        let bytes = canonical::to_canonical_ndjson(rows).map_err(|e| serialize_err(rel, e))?;
        self.write_bytes(rel, &bytes)
    }

    pub fn write_gzip_json<T: Serialize + ?Sized>(
        &mut self,
        rel: &str,
        doc: &T,
    ) -> Result<ArtifactRef, ArtifactError> {
        let bytes = canonical::to_canonical_document(doc).map_err(|e| serialize_err(rel, e))?;
        self.write_gzip(rel, &bytes)
    }

    pub fn write_gzip_ndjson<T: Serialize>(
        &mut self,
        rel: &str,
        rows: &[T],
    ) -> Result<ArtifactRef, ArtifactError> {
        let bytes = canonical::to_canonical_ndjson(rows).map_err(|e| serialize_err(rel, e))?;
        self.write_gzip(rel, &bytes)
    }

    /// Write a manifest. The manifest itself is not added to [`written`](Self::written).
    pub fn write_manifest(&self, rel: &str, manifest: &Manifest) -> Result<ArtifactRef, ArtifactError> {
        let bytes = canonical::to_canonical_document(manifest).map_err(|e| serialize_err(rel, e))?;
        self.persist(rel, &bytes)
    }

    fn write_gzip(&mut self, rel: &str, plain: &[u8]) -> Result<ArtifactRef, ArtifactError> {
        let gz = gzip_deterministic(plain).map_err(|source| ArtifactError::Compress {
            path: rel.to_string(),
            source,
        })?;
        self.write_bytes(rel, &gz)
    }

    fn write_bytes(&mut self, rel: &str, bytes: &[u8]) -> Result<ArtifactRef, ArtifactError> {
        let artifact = self.persist(rel, bytes)?;
        self.written.retain(|a| a.path != artifact.path);
        self.written.push(artifact.clone());
        Ok(artifact)
    }

    fn persist(&self, rel: &str, bytes: &[u8]) -> Result<ArtifactRef, ArtifactError> {
        store::write_atomic(&self.root.join(rel), bytes)?;
        let artifact = ArtifactRef {
            path: rel.to_string(),
            sha256: hashing::sha256_hex(bytes),
            bytes: bytes.len() as u64,
        };
        debug!(path = rel, bytes = artifact.bytes, sha256 = %artifact.sha256, "artifact written");
        Ok(artifact)
    }
}

fn serialize_err(rel: &str, source: serde_json::Error) -> ArtifactError {
    ArtifactError::Serialize {
        path: rel.to_string(),
        source,
    }
}

/// SHA-256 of a document's canonical serialization.
pub fn hash_object<T: Serialize + ?Sized>(doc: &T) -> Result<String, serde_json::Error> {
    canonical::to_canonical_string(doc).map(|s| hashing::sha256_hex(s.as_bytes()))
}

/// Fail if the publish tree under `root/rel_dir` holds more files than the
/// policy allows, or any file in it exceeds the size ceiling. Directories
/// are walked but not counted. A missing directory passes.
pub fn enforce_build_limits(root: &Path, rel_dir: &str, policy: &BuildPolicy) -> Result<(), ArtifactError> {
    let dir = root.join(rel_dir);
    if !dir.exists() {
        return Ok(());
    }
    let scan_err = |source: std::io::Error| ArtifactError::Scan {
        dir: rel_dir.to_string(),
        source,
    };

    let max_files = policy.limits.max_file_count_per_publish_folder;
    let max_bytes = policy.limits.max_artifact_size_bytes;
    let mut files = 0usize;
    for entry in WalkDir::new(&dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| scan_err(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        files += 1;
        if files > max_files {
            return Err(ArtifactError::FileCount {
                max: max_files,
                dir: rel_dir.to_string(),
            });
        }
        let meta = entry.metadata().map_err(|e| scan_err(e.into()))?;
        if meta.len() > max_bytes {
            return Err(ArtifactError::FileSize {
                max: max_bytes,
                path: relative_to(root, entry.path()),
            });
        }
    }
    Ok(())
}

/// Root-relative, `/`-separated form of `path`.
pub(crate) fn relative_to(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
