use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::models::SourceRecord;

/// Persisted mapping from `DDMMYYYY` date key to a source's record.
///
/// The storage format is pluggable behind this trait; the pipeline only
/// relies on the get/insert/persist contract.
pub trait CacheStore: Send + Sync {
    fn get(&self, date_key: &str) -> Option<&SourceRecord>;
    fn insert(&mut self, date_key: String, record: SourceRecord);
    fn keys(&self) -> Vec<String>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Durably write the in-memory state to storage.
    fn persist(&self) -> Result<()>;
}

/// JSON-file-backed cache store, one file per source.
///
/// Entries are never deleted here; clearing a cache is an explicit
/// operator action (`clear-cache`), not part of a collection run.
#[derive(Debug)]
pub struct JsonFileCache {
    path: PathBuf,
    entries: BTreeMap<String, SourceRecord>,
}

impl JsonFileCache {
    /// Load a cache from disk. A missing or empty file means "no dates
    /// cached yet"; a file that exists but cannot be parsed is fatal, so a
    /// corrupt store is never silently clobbered.
    pub fn load(path: impl Into<PathBuf>, tag: &str) -> Result<Self> {
        let path = path.into();

        if !path.exists() {
            info!("[{}] No cache file at {}, starting empty", tag, path.display());
            return Ok(Self {
                path,
                entries: BTreeMap::new(),
            });
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache file {}", path.display()))?;

        if content.trim().is_empty() {
            warn!("[{}] Cache file {} is empty, starting fresh", tag, path.display());
            return Ok(Self {
                path,
                entries: BTreeMap::new(),
            });
        }

        let entries: BTreeMap<String, SourceRecord> = serde_json::from_str(&content)
            .with_context(|| {
                format!(
                    "Cache file {} is corrupted; move it aside or clear-cache to re-fetch",
                    path.display()
                )
            })?;

        info!("[{}] Cache loaded: {} entries", tag, entries.len());
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheStore for JsonFileCache {
    fn get(&self, date_key: &str) -> Option<&SourceRecord> {
        self.entries.get(date_key)
    }

    fn insert(&mut self, date_key: String, record: SourceRecord) {
        self.entries.insert(date_key, record);
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn persist(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.entries)?;
        // Write-then-rename so a crash mid-write leaves the old snapshot intact
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write cache temp file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace cache file {}", self.path.display()))?;
        Ok(())
    }
}
