//! Persistent cache index.
//!
//! The index is kept in memory as two maps (path → entry, hash → paths) and
//! persisted as JSON:
//!
//! ```json
//! {
//!   "version": 1,
//!   "entries": [
//!     { "hash": "A999…", "path": "/cache/A999….tex", "lastModifiedTicks": 17293… }
//!   ]
//! }
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::entry::FileCacheEntry;
use crate::error::Result;

/// Schema version of the index file.
pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile {
    version: u32,
    entries: Vec<FileCacheEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct CacheIndex {
    by_path: BTreeMap<Utf8PathBuf, FileCacheEntry>,
    by_hash: HashMap<String, Vec<Utf8PathBuf>>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Insert or replace the entry for `entry.path`.
    pub fn upsert(&mut self, entry: FileCacheEntry) -> Option<FileCacheEntry> {
        let previous = self.remove_by_path(&entry.path);
        self.by_hash
            .entry(entry.hash.clone())
            .or_default()
            .push(entry.path.clone());
        self.by_path.insert(entry.path.clone(), entry);
        previous
    }

    pub fn remove_by_path(&mut self, path: &Utf8Path) -> Option<FileCacheEntry> {
        let removed = self.by_path.remove(path)?;
        if let Some(paths) = self.by_hash.get_mut(&removed.hash) {
            paths.retain(|p| p != path);
            if paths.is_empty() {
                self.by_hash.remove(&removed.hash);
            }
        }
        Some(removed)
    }

    /// Remove every entry carrying `hash`.
    pub fn remove_by_hash(&mut self, hash: &str) -> Vec<FileCacheEntry> {
        let Some(paths) = self.by_hash.remove(hash) else {
            return Vec::new();
        };
        paths
            .iter()
            .filter_map(|path| self.by_path.remove(path))
            .collect()
    }

    pub fn get_by_path(&self, path: &Utf8Path) -> Option<&FileCacheEntry> {
        self.by_path.get(path)
    }

    /// All entries with `hash`, in insertion order.
    pub fn get_by_hash<'a>(&'a self, hash: &str) -> impl Iterator<Item = &'a FileCacheEntry> + 'a {
        self.by_hash
            .get(hash)
            .into_iter()
            .flatten()
            .filter_map(|path| self.by_path.get(path))
    }

    /// Entries ordered by path.
    pub fn entries(&self) -> impl Iterator<Item = &FileCacheEntry> {
        self.by_path.values()
    }

    /// Load the index from `path`. A missing file yields an empty index.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        if !path.as_std_path().exists() {
            tracing::info!("Cache index {} not found, starting empty", path);
            return Ok(Self::new());
        }

        let contents = std::fs::read_to_string(path.as_std_path())?;
        let file: IndexFile = serde_json::from_str(&contents)?;
        if file.version != INDEX_VERSION {
            tracing::warn!(
                "Cache index {} has version {}, expected {}; starting empty",
                path,
                file.version,
                INDEX_VERSION
            );
            return Ok(Self::new());
        }

        let mut index = Self::new();
        for entry in file.entries {
            index.upsert(entry);
        }
        tracing::debug!("Loaded {} cache entries from {}", index.len(), path);
        Ok(index)
    }

    /// Persist the index to `path` via a temporary file and rename.
    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                std::fs::create_dir_all(parent.as_std_path())?;
            }
        }

        let file = IndexFile {
            version: INDEX_VERSION,
            entries: self.entries().cloned().collect(),
        };
        let contents = serde_json::to_string_pretty(&file)?;

        let tmp = Utf8PathBuf::from(format!("{path}.tmp"));
        if let Err(e) = std::fs::write(tmp.as_std_path(), contents)
            .and_then(|_| std::fs::rename(tmp.as_std_path(), path.as_std_path()))
        {
            let _ = std::fs::remove_file(tmp.as_std_path());
            return Err(e.into());
        }
        Ok(())
    }
}
