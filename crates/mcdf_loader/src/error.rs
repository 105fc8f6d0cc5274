//! Error types for building, loading and applying archives.
//!
//! All fallible functions in this crate return [`Result<T>`]. Errors from the
//! format and cache crates, `std::io` and `serde_json` convert via `From`.

use camino::Utf8PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing the archive container failed (corrupt header,
    /// unsupported version, truncated body).
    #[error("archive error: {0}")]
    Format(#[from] mcdf_format::FormatError),

    #[error("cache error: {0}")]
    Cache(#[from] mcdf_cache::Error),

    /// A replacement names a hash the cache cannot resolve to a readable file.
    #[error("no cached file for hash {hash} (game paths: {})", .game_paths.join(", "))]
    MissingSourceFile {
        hash: String,
        game_paths: Vec<String>,
    },

    /// A source file is too large for the archive's 32-bit record length.
    #[error("file {path} is {size} bytes, larger than an archive record allows")]
    FileTooLarge { path: Utf8PathBuf, size: u64 },

    /// A service needed by the requested operation is missing or failed its version probe.
    #[error("{0} service is not available")]
    ServiceUnavailable(&'static str),

    /// A service call failed.
    #[error("{service} service error: {message}")]
    Service {
        service: &'static str,
        message: String,
    },

    /// Two applications raced for the same target.
    #[error("concurrent application for target {0}")]
    ConcurrencyViolation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{step} timed out after {after:?}")]
    TimedOut { step: &'static str, after: Duration },

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),

    #[error("internal lock poisoned")]
    LockPoisoned,
}

impl Error {
    pub fn service(service: &'static str, message: impl Into<String>) -> Self {
        Error::Service {
            service,
            message: message.into(),
        }
    }

    /// Whether this error means the archive body ended early.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            Error::Format(mcdf_format::FormatError::EndOfStream { .. })
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Cache(mcdf_cache::Error::Cancelled))
    }
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
