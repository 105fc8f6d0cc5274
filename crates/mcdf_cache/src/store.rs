//! The content-addressed file cache.
//!
//! [`FileCacheStore`] reconciles a persisted [`CacheIndex`] against the files
//! on disk. Full scans ([`FileCacheStore::scan`]) walk the configured roots and
//! hash new or modified files on a dedicated rayon pool; incremental rescans
//! ([`FileCacheStore::rescan_paths`]) only touch the given paths. Both are
//! serialized by an async mutex and commit their result atomically: the index
//! is persisted first and only then swapped in memory.

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::CacheConfig;
use crate::entry::FileCacheEntry;
use crate::error::{Error, Result};
use crate::hasher::ContentHasher;
use crate::index::CacheIndex;

/// A directory walked by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRoot {
    pub path: Utf8PathBuf,
    pub recursive: bool,
    /// Apply the scan's [`ExtensionFilter`] to files under this root.
    pub filtered: bool,
}

impl ScanRoot {
    pub fn recursive(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            recursive: true,
            filtered: true,
        }
    }

    pub fn flat(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            recursive: false,
            filtered: false,
        }
    }
}

/// Case-insensitive extension allow-list. An empty filter accepts every file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn matches(&self, path: &Utf8Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

/// Entries added (new or rehashed) and removed by a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub added: Vec<FileCacheEntry>,
    pub removed: Vec<FileCacheEntry>,
}

impl ScanOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
struct ScanProgress {
    scanned: AtomicUsize,
    total: AtomicUsize,
    running: AtomicBool,
}

impl ScanProgress {
    fn start(&self, total: usize) {
        self.scanned.store(0, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
        self.running.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Point-in-time view of scan progress for hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanProgressSnapshot {
    pub scanned: usize,
    pub total: usize,
    pub running: bool,
}

/// Clears the running flag however the scan ends.
struct ProgressGuard(Arc<ScanProgress>);

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        self.0.stop();
    }
}

pub struct FileCacheStore {
    config: CacheConfig,
    hasher: ContentHasher,
    index: RwLock<CacheIndex>,
    scan_lock: tokio::sync::Mutex<()>,
    progress: Arc<ScanProgress>,
    cache_size: AtomicU64,
}

impl std::fmt::Debug for FileCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCacheStore")
            .field("cache_folder", &self.config.cache_folder)
            .field("entries", &self.len())
            .finish()
    }
}

impl FileCacheStore {
    /// Open the store, loading the persisted index if there is one.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let index = CacheIndex::load(&config.index_file)?;
        let hasher = ContentHasher::new(config.lock_retry.clone());
        let store = Self {
            config,
            hasher,
            index: RwLock::new(index),
            scan_lock: tokio::sync::Mutex::new(()),
            progress: Arc::new(ScanProgress::default()),
            cache_size: AtomicU64::new(0),
        };
        store.recalculate_cache_size();
        Ok(store)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.read_index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all committed entries.
    pub fn entries(&self) -> Vec<FileCacheEntry> {
        self.read_index().entries().cloned().collect()
    }

    /// Hash `path` into a fresh entry without touching the index.
    pub fn create(&self, path: &Utf8Path) -> Result<FileCacheEntry> {
        self.hasher.create_entry(path)
    }

    /// First committed entry for `hash` whose file still exists.
    pub fn lookup(&self, hash: &str) -> Option<FileCacheEntry> {
        let index = self.read_index();
        let found = index.get_by_hash(hash).find(|entry| entry.exists()).cloned();
        found
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, CacheIndex> {
        // A poisoned read still sees the last committed index.
        self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Roots derived from the configuration: the cache folder (flat) and the
    /// content folder (recursive, extension filtered).
    pub fn default_roots(&self) -> Vec<ScanRoot> {
        let mut roots = vec![ScanRoot::flat(self.config.cache_folder.clone())];
        if let Some(content) = &self.config.content_folder {
            roots.push(ScanRoot::recursive(content.clone()));
        }
        roots
    }

    pub fn default_filter(&self) -> ExtensionFilter {
        ExtensionFilter::new(&self.config.extensions)
    }

    pub fn progress(&self) -> ScanProgressSnapshot {
        ScanProgressSnapshot {
            scanned: self.progress.scanned.load(Ordering::Relaxed),
            total: self.progress.total.load(Ordering::Relaxed),
            running: self.progress.running.load(Ordering::Acquire),
        }
    }

    /// Total size in bytes of the files directly inside the cache folder.
    pub fn cache_size(&self) -> u64 {
        self.cache_size.load(Ordering::Relaxed)
    }

    pub fn recalculate_cache_size(&self) -> u64 {
        let size = folder_size(&self.config.cache_folder);
        self.cache_size.store(size, Ordering::Relaxed);
        size
    }

    /// Full scan of the configured roots with the configured filter and parallelism.
    pub async fn scan_all(&self, cancel: &CancellationToken) -> Result<ScanOutcome> {
        let roots = self.default_roots();
        let filter = self.default_filter();
        self.scan(&roots, &filter, self.config.parallelism(), cancel)
            .await
    }

    /// Reconcile the index against every file under `roots`.
    ///
    /// Entries whose file disappeared are removed, modified files are
    /// rehashed and unseen files are added. A cancelled scan commits nothing.
    pub async fn scan(
        &self,
        roots: &[ScanRoot],
        filter: &ExtensionFilter,
        parallelism: usize,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome> {
        let _serial = self.scan_lock.lock().await;
        tracing::info!(roots = roots.len(), parallelism, "Starting cache scan");

        let job = ScanJob {
            roots: roots.to_vec(),
            filter: filter.clone(),
            parallelism: parallelism.max(1),
            batch_size: self.config.batch_size(),
            index_file: self.config.index_file.clone(),
            snapshot: self.read_index().clone(),
            hasher: self.hasher.clone(),
            progress: Arc::clone(&self.progress),
            cancel: cancel.clone(),
        };

        let (index, outcome) = tokio::task::spawn_blocking(move || job.run()).await??;
        self.commit(index)?;

        tracing::info!(
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            entries = self.len(),
            cache_size = self.cache_size(),
            "Cache scan complete"
        );
        Ok(outcome)
    }

    /// Reconcile only `paths`: missing files are removed, present files are
    /// rehashed and upserted.
    pub async fn rescan_paths(
        &self,
        paths: Vec<Utf8PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome> {
        let _serial = self.scan_lock.lock().await;
        tracing::debug!(paths = paths.len(), "Rescanning changed paths");

        let snapshot = self.read_index().clone();
        let hasher = self.hasher.clone();
        let index_file = self.config.index_file.clone();
        let cancel = cancel.clone();

        let result = tokio::task::spawn_blocking(move || {
            rescan_blocking(snapshot, &hasher, &index_file, paths, &cancel)
        })
        .await??;

        if let Some((index, outcome)) = result {
            self.commit(index)?;
            tracing::info!(
                added = outcome.added.len(),
                removed = outcome.removed.len(),
                "Incremental rescan committed"
            );
            return Ok(outcome);
        }
        Ok(ScanOutcome::default())
    }

    /// Swap in an index that was already persisted.
    fn commit(&self, index: CacheIndex) -> Result<()> {
        *self.index.write()? = index;
        self.recalculate_cache_size();
        Ok(())
    }
}

struct ScanJob {
    roots: Vec<ScanRoot>,
    filter: ExtensionFilter,
    parallelism: usize,
    batch_size: usize,
    index_file: Utf8PathBuf,
    snapshot: CacheIndex,
    hasher: ContentHasher,
    progress: Arc<ScanProgress>,
    cancel: CancellationToken,
}

impl ScanJob {
    fn run(self) -> Result<(CacheIndex, ScanOutcome)> {
        let mut discovered = self.discover()?;

        let mut outcome = ScanOutcome::default();
        let mut to_hash = Vec::new();
        for entry in self.snapshot.entries() {
            discovered.remove(&entry.path);
            if !entry.exists() {
                outcome.removed.push(entry.clone());
            } else if entry.is_stale() {
                to_hash.push(entry.path.clone());
            }
        }
        to_hash.extend(discovered);

        tracing::debug!(
            files = to_hash.len(),
            missing = outcome.removed.len(),
            "Hashing new and modified files"
        );

        self.progress.start(to_hash.len());
        let _progress = ProgressGuard(Arc::clone(&self.progress));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .thread_name(|i| format!("mcdf-scan-{i}"))
            .build()
            .map_err(|e| Error::Task(e.to_string()))?;

        for batch in to_hash.chunks(self.batch_size) {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let results: Vec<Option<(Utf8PathBuf, Result<FileCacheEntry>)>> = pool.install(|| {
                batch
                    .par_iter()
                    .map(|path| {
                        if self.cancel.is_cancelled() {
                            return None;
                        }
                        let result = self.hasher.create_entry(path);
                        self.progress.scanned.fetch_add(1, Ordering::Relaxed);
                        Some((path.clone(), result))
                    })
                    .collect()
            });

            for (path, result) in results.into_iter().flatten() {
                match result {
                    Ok(entry) => outcome.added.push(entry),
                    Err(e) => {
                        tracing::warn!(%path, error = %e, "Skipping file that could not be hashed");
                        if let Some(stale) = self.snapshot.get_by_path(&path) {
                            outcome.removed.push(stale.clone());
                        }
                    }
                }
            }
        }

        if self.cancel.is_cancelled() {
            tracing::info!("Cache scan cancelled, nothing committed");
            return Err(Error::Cancelled);
        }

        let mut index = self.snapshot;
        for entry in &outcome.removed {
            index.remove_by_path(&entry.path);
        }
        for entry in &outcome.added {
            index.upsert(entry.clone());
        }
        index.save(&self.index_file)?;

        Ok((index, outcome))
    }

    /// Walk every root and collect candidate files.
    fn discover(&self) -> Result<BTreeSet<Utf8PathBuf>> {
        let mut found = BTreeSet::new();
        for root in &self.roots {
            if !root.path.as_std_path().is_dir() {
                tracing::warn!(root = %root.path, "Scan root is not a directory, skipping");
                continue;
            }

            let depth = if root.recursive { usize::MAX } else { 1 };
            for entry in WalkDir::new(root.path.as_std_path()).max_depth(depth) {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read directory entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = match Utf8PathBuf::from_path_buf(entry.into_path()) {
                    Ok(path) => path,
                    Err(path) => {
                        tracing::warn!(path = %path.display(), "Skipping non UTF-8 path");
                        continue;
                    }
                };
                if is_ignored(&path, &self.index_file) {
                    continue;
                }
                if root.filtered && !self.filter.matches(&path) {
                    continue;
                }
                found.insert(path);
            }
        }
        Ok(found)
    }
}

/// Returns `None` when nothing changed.
fn rescan_blocking(
    snapshot: CacheIndex,
    hasher: &ContentHasher,
    index_file: &Utf8Path,
    paths: Vec<Utf8PathBuf>,
    cancel: &CancellationToken,
) -> Result<Option<(CacheIndex, ScanOutcome)>> {
    let mut index = snapshot;
    let mut outcome = ScanOutcome::default();

    let unique: BTreeSet<Utf8PathBuf> = paths.into_iter().collect();
    for path in unique {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if is_ignored(&path, index_file) {
            continue;
        }

        if !path.as_std_path().is_file() {
            if let Some(removed) = index.remove_by_path(&path) {
                outcome.removed.push(removed);
            }
            continue;
        }

        match hasher.create_entry(&path) {
            Ok(entry) => {
                if index.get_by_path(&path) != Some(&entry) {
                    index.upsert(entry.clone());
                    outcome.added.push(entry);
                }
            }
            Err(e) => {
                tracing::warn!(%path, error = %e, "Skipping changed file that could not be hashed");
                if let Some(removed) = index.remove_by_path(&path) {
                    outcome.removed.push(removed);
                }
            }
        }
    }

    if outcome.is_empty() {
        return Ok(None);
    }
    index.save(index_file)?;
    Ok(Some((index, outcome)))
}

/// Temporary files and the index itself never enter the cache.
fn is_ignored(path: &Utf8Path, index_file: &Utf8Path) -> bool {
    path == index_file
        || path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("tmp"))
}

fn folder_size(folder: &Utf8Path) -> u64 {
    let Ok(read_dir) = std::fs::read_dir(folder.as_std_path()) else {
        return 0;
    };
    read_dir
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum()
}
