//! Error types for cache operations.
//!
//! All fallible functions in this crate return [`Result<T>`]. I/O and JSON
//! errors convert automatically via `From`.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem I/O failed (file vanished, permission denied, ...).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse or serialize the cache index or configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another process kept the file locked past the retry budget.
    #[error("file is locked by another process: {0}")]
    FileLocked(Utf8PathBuf),

    /// A path is not valid UTF-8 and cannot be indexed.
    #[error("path is not valid UTF-8: {0}")]
    InvalidPath(String),

    /// The operation observed its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// The filesystem watcher could not be created or attached.
    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),

    /// An index lock was poisoned by a panicking writer.
    #[error("cache index lock poisoned")]
    LockPoisoned,
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockPoisoned
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}
