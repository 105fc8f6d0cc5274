//! Loader configuration.
//!
//! Persisted as camelCase JSON next to the host's other settings:
//!
//! ```json
//! {
//!   "cache": { "cacheFolder": "/data/cache", "indexFile": "/data/file_cache.json" },
//!   "stagingFolder": "/data/staging",
//!   "compressionLevel": 12,
//!   "apply": { "maxConcurrentApplies": 2, "stagingTimeoutMs": 15000 }
//! }
//! ```
//!
//! Every field has a default, so partial files are fine.

use crate::error::Result;
use camino::{Utf8Path, Utf8PathBuf};
use mcdf_cache::CacheConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lock code passed to the appearance service so other tools leave the state alone.
pub const DEFAULT_LOCK_CODE: u32 = 0x6D61_7265;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoaderConfig {
    pub cache: CacheConfig,

    /// Folder receiving extracted staging files.
    pub staging_folder: Utf8PathBuf,

    /// zstd level used when saving archives.
    pub compression_level: i32,

    pub apply: ApplyConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            staging_folder: std::env::temp_dir()
                .join("mcdf")
                .to_str()
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| Utf8PathBuf::from("mcdf_staging")),
            compression_level: mcdf_format::DEFAULT_COMPRESSION_LEVEL,
            apply: ApplyConfig::default(),
        }
    }
}

/// Limits and timeouts of the apply pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplyConfig {
    /// Apply pipelines allowed to run at once.
    pub max_concurrent_applies: usize,
    /// Timeout for each staging step (snapshot, extraction, collection setup).
    pub staging_timeout_ms: u64,
    /// Timeout for the target to finish drawing after a redraw.
    pub draw_timeout_ms: u64,
    /// Pause between reverts when removing all applications.
    pub revert_delay_ms: u64,
    pub lock_code: u32,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_applies: 2,
            staging_timeout_ms: 15_000,
            draw_timeout_ms: 30_000,
            revert_delay_ms: 250,
            lock_code: DEFAULT_LOCK_CODE,
        }
    }
}

impl ApplyConfig {
    pub fn staging_timeout(&self) -> Duration {
        Duration::from_millis(self.staging_timeout_ms)
    }

    pub fn draw_timeout(&self) -> Duration {
        Duration::from_millis(self.draw_timeout_ms)
    }

    pub fn revert_delay(&self) -> Duration {
        Duration::from_millis(self.revert_delay_ms)
    }

    pub fn permits(&self) -> usize {
        self.max_concurrent_applies.max(1)
    }
}

impl LoaderConfig {
    /// Load configuration from `path`, falling back to defaults if it doesn't exist.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        if !path.as_std_path().exists() {
            tracing::info!("Loader config {} not found, using defaults", path);
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path.as_std_path())?;
        let config: Self = serde_json::from_str(&contents)?;
        tracing::info!("Loaded loader config from {}", path);
        Ok(config)
    }

    /// Save configuration to `path`, creating parent directories if needed.
    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent.as_std_path())?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_std_path(), contents)?;
        tracing::info!("Saved loader config to {}", path);
        Ok(())
    }
}
