//! Content-addressed file cache used when building chara archives.
//!
//! Files from the managed cache folder and the installed content folder are
//! indexed by their SHA-1 content hash so archive creation can resolve a hash
//! back to a readable file. The index is persisted as JSON and kept current by
//! full scans, incremental rescans and an optional filesystem watcher.
//!
//! ```no_run
//! # async fn demo() -> mcdf_cache::Result<()> {
//! use mcdf_cache::{CacheConfig, FileCacheStore};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = CacheConfig::new("/data/cache", "/data/file_cache.json")
//!     .with_content_folder("/data/mods");
//! let store = FileCacheStore::open(config)?;
//! let outcome = store.scan_all(&CancellationToken::new()).await?;
//! println!("{} new entries", outcome.added.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod error;
pub mod hasher;
pub mod index;
pub mod store;
pub mod watcher;

pub use config::{CacheConfig, LockRetryConfig};
pub use entry::FileCacheEntry;
pub use error::{Error, Result};
pub use hasher::{hash_bytes, ContentHasher};
pub use index::CacheIndex;
pub use store::{ExtensionFilter, FileCacheStore, ScanOutcome, ScanProgressSnapshot, ScanRoot};
pub use watcher::{CacheWatcher, RescanDebouncer, RescanSink};
