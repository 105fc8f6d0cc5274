//! Cache configuration.
//!
//! [`CacheConfig`] is persisted as camelCase JSON. A missing file yields the
//! defaults; a malformed file is an error.

use crate::error::Result;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Extensions tracked inside the content folder.
pub const DEFAULT_EXTENSIONS: [&str; 3] = ["mtrl", "mdl", "tex"];

/// Smallest allowed debounce window for change-triggered rescans.
pub const MIN_DEBOUNCE_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Folder holding cached content files. Scanned non-recursively.
    pub cache_folder: Utf8PathBuf,

    /// Folder holding installed mod content. Scanned recursively and filtered by extension.
    pub content_folder: Option<Utf8PathBuf>,

    /// Location of the persisted cache index.
    pub index_file: Utf8PathBuf,

    /// Lower-case extensions (without dot) picked up in the content folder.
    pub extensions: Vec<String>,

    /// Worker threads used by full scans.
    pub max_parallel_scan: usize,

    /// Files hashed per batch; cancellation is checked between batches.
    pub scan_batch_size: usize,

    /// Debounce window for change-triggered rescans.
    pub debounce_ms: u64,

    pub lock_retry: LockRetryConfig,
}

/// Exponential backoff used while waiting for another process to release a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockRetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 50,
            max_backoff_ms: 1000,
            max_attempts: 30,
        }
    }
}

impl LockRetryConfig {
    /// Delay before retry number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_folder: Utf8PathBuf::new(),
            content_folder: None,
            index_file: Utf8PathBuf::from("file_cache.json"),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            max_parallel_scan: default_parallelism(),
            scan_batch_size: 64,
            debounce_ms: MIN_DEBOUNCE_MS,
            lock_retry: LockRetryConfig::default(),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl CacheConfig {
    pub fn new(cache_folder: impl Into<Utf8PathBuf>, index_file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cache_folder: cache_folder.into(),
            index_file: index_file.into(),
            ..Default::default()
        }
    }

    pub fn with_content_folder(mut self, folder: impl Into<Utf8PathBuf>) -> Self {
        self.content_folder = Some(folder.into());
        self
    }

    /// Debounce window, clamped to [`MIN_DEBOUNCE_MS`].
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.max(MIN_DEBOUNCE_MS))
    }

    pub fn parallelism(&self) -> usize {
        self.max_parallel_scan.max(1)
    }

    pub fn batch_size(&self) -> usize {
        self.scan_batch_size.max(1)
    }

    /// Load configuration from `path`, falling back to defaults if it doesn't exist.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        if !path.as_std_path().exists() {
            tracing::info!("Cache config {} not found, using defaults", path);
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path.as_std_path())?;
        let config: Self = serde_json::from_str(&contents)?;
        tracing::debug!("Loaded cache config from {}", path);
        Ok(config)
    }

    /// Save configuration to `path`, creating parent directories if needed.
    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent.as_std_path())?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_std_path(), contents)?;
        Ok(())
    }
}
