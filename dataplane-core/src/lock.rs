//! Run lock keyed by (provider, dataset, UTC day).
//!
//! One file per key under `mirrors/ops/locks/`. Creation is atomic: the lock
//! document is written to a temp file and hard-linked into place, which
//! fails if the lock already exists. An expired or unreadable lock is
//! removed and creation retried once. Contention is not an error; it is
//! reported as [`LockOutcome::Held`].

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::canonical;
use crate::store;

pub const DEFAULT_TTL_SECONDS: i64 = 900;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("LOCK_IO:{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path, source: io::Error) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What a lock file holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDocument {
    pub provider: String,
    pub dataset: String,
    pub day: NaiveDate,
    /// Run id of the holder.
    pub owner: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Lock identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKey {
    pub provider: String,
    pub dataset: String,
    pub day: NaiveDate,
}

impl LockKey {
    pub fn new(provider: &str, dataset: &str, day: NaiveDate) -> Self {
        Self {
            provider: provider.to_string(),
            dataset: dataset.to_string(),
            day,
        }
    }

    /// `<provider>__<dataset>__<YYYY-MM-DD>.lock.json`, each part sanitized.
    pub fn file_name(&self) -> String {
        format!(
            "{}__{}__{}.lock.json",
            sanitize(&self.provider),
            sanitize(&self.dataset),
            self.day.format("%Y-%m-%d")
        )
    }
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`.
pub fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(LockGuard),
    Held(LockDocument),
}

/// Held lock. Dropping it releases the lock if this run still owns it.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    doc: LockDocument,
    released: bool,
}

impl LockGuard {
    pub fn document(&self) -> &LockDocument {
        &self.doc
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort, idempotent delete. A lock that was taken over by another
    /// owner is left alone.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match store::read_json::<LockDocument>(&self.path) {
            Ok(Some(current)) if current.owner != self.doc.owner => {
                warn!(path = %self.path.display(), owner = %current.owner, "lock now owned by another run, not releasing");
            }
            Ok(None) => {}
            _ => match fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "lock released"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %self.path.display(), error = %e, "failed to release lock"),
            },
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct RunLock {
    dir: PathBuf,
    ttl: Duration,
}

impl RunLock {
    pub fn new(dir: impl Into<PathBuf>, ttl_seconds: i64) -> Self {
        Self {
            dir: dir.into(),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    pub fn path_for(&self, key: &LockKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    pub fn acquire(&self, key: &LockKey, owner: &str) -> Result<LockOutcome, LockError> {
        self.acquire_at(key, owner, Utc::now())
    }

    pub fn acquire_at(
        &self,
        key: &LockKey,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<LockOutcome, LockError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let path = self.path_for(key);
        let doc = LockDocument {
            provider: key.provider.clone(),
            dataset: key.dataset.clone(),
            day: key.day,
            owner: owner.to_string(),
            locked_at: now,
            expires_at: now + self.ttl,
        };

        for attempt in 0..2 {
            if create_exclusive(&path, &doc)? {
                info!(path = %path.display(), expires_at = %doc.expires_at, "lock acquired");
                return Ok(LockOutcome::Acquired(LockGuard {
                    path,
                    doc,
                    released: false,
                }));
            }

            match store::read_json::<LockDocument>(&path) {
                Ok(Some(existing)) if existing.expires_at > now => {
                    info!(path = %path.display(), owner = %existing.owner, expires_at = %existing.expires_at, "lock held");
                    return Ok(LockOutcome::Held(existing));
                }
                Ok(Some(_)) => debug!(path = %path.display(), attempt, "replacing expired lock"),
                Ok(None) | Err(_) => warn!(path = %path.display(), attempt, "replacing unreadable lock"),
            }
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&path, e)),
            }
        }

        // Lost the race twice; whoever won holds it now.
        match store::read_json::<LockDocument>(&path) {
            Ok(Some(existing)) => Ok(LockOutcome::Held(existing)),
            _ => Err(io_err(
                &path,
                io::Error::new(io::ErrorKind::Other, "lock contended but unreadable"),
            )),
        }
    }
}

/// Create `path` holding `doc` only if it does not exist. `Ok(false)` when
/// it already exists.
fn create_exclusive(path: &Path, doc: &LockDocument) -> Result<bool, LockError> {
    let bytes = canonical::to_canonical_document(doc)
        .map_err(|e| io_err(path, io::Error::new(io::ErrorKind::InvalidData, e)))?;

    let tmp = store::temp_sibling(path);
    fs::write(&tmp, &bytes).map_err(|e| io_err(&tmp, e))?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => return Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => debug!(error = %e, "hard link unsupported, falling back to create_new"),
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(&bytes)
                .and_then(|_| file.sync_all())
                .map_err(|e| io_err(path, e))?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(io_err(path, e)),
    }
}
