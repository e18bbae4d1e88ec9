//! Lazy container cache
//!
//! Memoizes the image produced by an idempotent container run, keyed by base
//! image and normalized command. Entries older than the TTL count as absent.
//! The table is a JSON file under the cache root, rewritten atomically.

use crate::error::{PkgmillError, PkgmillResult};
use crate::orchestration::container::ContainerCommand;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default time-to-live for cached results
pub const DEFAULT_TTL_DAYS: i64 = 7;

/// One memoized result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyEntry {
    /// Image id committed from the finished container
    pub result: String,
    pub created_at: DateTime<Utc>,
}

/// Persistent (image, command) -> result table
#[derive(Debug, Clone)]
pub struct LazyCache {
    path: PathBuf,
    ttl: Duration,
}

/// Stable key for an image and command. Shell scripts are dedented and
/// trimmed so re-indenting one does not miss the cache; argument vectors are
/// hashed exactly.
pub fn cache_key(image: &str, command: &ContainerCommand) -> String {
    let normalized = match command {
        ContainerCommand::Shell(script) => vec![
            "sh".to_string(),
            "-c".to_string(),
            textwrap::dedent(script).trim().to_string(),
        ],
        other => other.argv(),
    };

    let mut hasher = Sha256::new();
    hasher.update(image.as_bytes());
    hasher.update([0]);
    for part in &normalized {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

impl LazyCache {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    /// Cache stored at `<root>/lazy-containers.json` with the default TTL
    pub fn in_dir(root: &Path) -> Self {
        Self::new(root.join("lazy-containers.json"), Duration::days(DEFAULT_TTL_DAYS))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn load(&self) -> PkgmillResult<BTreeMap<String, LazyEntry>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(table) => Ok(table),
                Err(e) => {
                    // A corrupt table only costs recomputation
                    debug!("Ignoring unreadable lazy cache {}: {}", self.path.display(), e);
                    Ok(BTreeMap::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(PkgmillError::io(format!("reading {}", self.path.display()), e)),
        }
    }

    async fn save(&self, table: &BTreeMap<String, LazyEntry>) -> PkgmillResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PkgmillError::io(format!("creating {}", parent.display()), e))?;
        }

        let content = serde_json::to_string_pretty(table)?;
        let tmp = self.path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| PkgmillError::io(format!("writing {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PkgmillError::io(format!("replacing {}", self.path.display()), e))
    }

    /// Entry for `key` if it is younger than the TTL at `now`
    pub async fn lookup(&self, key: &str, now: DateTime<Utc>) -> PkgmillResult<Option<LazyEntry>> {
        let table = self.load().await?;
        Ok(table
            .get(key)
            .filter(|entry| now - entry.created_at < self.ttl)
            .cloned())
    }

    /// Record a result, replacing any previous entry for `key`
    pub async fn store(&self, key: &str, entry: LazyEntry) -> PkgmillResult<()> {
        let mut table = self.load().await?;
        table.insert(key.to_string(), entry);
        self.save(&table).await
    }

    /// Drop an entry whose image no longer exists
    pub async fn forget(&self, key: &str) -> PkgmillResult<()> {
        let mut table = self.load().await?;
        if table.remove(key).is_some() {
            self.save(&table).await?;
        }
        Ok(())
    }
}
