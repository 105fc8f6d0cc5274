//! Error types for archive encoding and decoding.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FormatError>;

/// Errors that can occur while reading or writing a chara archive.
#[derive(Error, Debug)]
pub enum FormatError {
    /// Filesystem or stream I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The archive declares a format version this crate does not understand.
    #[error("unsupported archive version {0} (supported: 1..={max})", max = crate::CURRENT_VERSION)]
    UnsupportedVersion(i32),

    /// The header failed its structural self-check (bad length, bad field, trailing bytes).
    #[error("corrupt archive: {0}")]
    Corrupt(String),

    /// The decompressed stream ended before a declared length (the prefix,
    /// the header or a record body) was read in full.
    #[error("unexpected end of stream: expected {expected} bytes, got {actual}")]
    EndOfStream { expected: u64, actual: u64 },

    /// A descriptor value cannot be represented in the on-disk format.
    #[error("value out of range: {0}")]
    OutOfRange(String),
}

impl FormatError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        FormatError::Corrupt(msg.into())
    }

    /// Maps a truncated decompressor stream onto [`FormatError::EndOfStream`].
    pub(crate) fn from_read(err: std::io::Error, expected: u64, actual: u64) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FormatError::EndOfStream { expected, actual }
        } else {
            FormatError::Io(err)
        }
    }
}
