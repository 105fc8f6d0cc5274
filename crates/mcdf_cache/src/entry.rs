use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A file known to the cache, addressed by its content hash.
///
/// The entry is only meaningful while `path` exists and its modification time
/// still equals `last_modified_ticks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCacheEntry {
    pub hash: String,
    pub path: Utf8PathBuf,
    /// Modification time in 100 ns ticks since the Unix epoch.
    pub last_modified_ticks: i64,
}

impl FileCacheEntry {
    pub fn new(hash: impl Into<String>, path: impl Into<Utf8PathBuf>, last_modified_ticks: i64) -> Self {
        Self {
            hash: hash.into(),
            path: path.into(),
            last_modified_ticks,
        }
    }

    pub fn exists(&self) -> bool {
        self.path.as_std_path().is_file()
    }

    /// Whether the file on disk no longer matches the stored modification time.
    ///
    /// A missing or unreadable file counts as stale.
    pub fn is_stale(&self) -> bool {
        match modified_ticks(&self.path) {
            Ok(ticks) => ticks != self.last_modified_ticks,
            Err(_) => true,
        }
    }
}

/// Convert a timestamp into 100 ns ticks relative to the Unix epoch.
pub fn ticks_from_system_time(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => (after.as_nanos() / 100).min(i64::MAX as u128) as i64,
        Err(before) => -((before.duration().as_nanos() / 100).min(i64::MAX as u128) as i64),
    }
}

/// Modification ticks of the file at `path`.
pub fn modified_ticks(path: &Utf8Path) -> std::io::Result<i64> {
    let metadata = std::fs::metadata(path.as_std_path())?;
    Ok(ticks_from_system_time(metadata.modified()?))
}
