//! Container format for chara appearance archives (`.mcdf`).
//!
//! An archive is a single zstd stream holding a little-endian header that
//! describes the bundled files, followed by the raw bytes of every file record
//! in table order:
//!
//! ```text
//! [i32 version][i32 header_length][header][record 0][record 1]...
//! ```
//!
//! Use [`ArchiveWriter`] / [`write_archive`] to produce archives and
//! [`ArchiveReader`] to read them back.

mod descriptor;
mod error;
pub mod header;
mod stream;

pub use descriptor::*;
pub use error::{FormatError, Result};
pub use header::{decode_header, encode_header, skip_header};
pub use stream::{write_archive, ArchiveReader, ArchiveWriter, DEFAULT_COMPRESSION_LEVEL};

/// The format version written by this crate.
pub const CURRENT_VERSION: i32 = 2;

/// The oldest format version this crate can still read.
pub const MIN_VERSION: i32 = 1;

/// File extension of chara archives, without the dot.
pub const ARCHIVE_EXTENSION: &str = "mcdf";

/// Whether `path` names a chara archive (case-insensitive `.mcdf` suffix).
pub fn has_archive_extension(path: &str) -> bool {
    let suffix_len = ARCHIVE_EXTENSION.len() + 1;
    path.len() >= suffix_len
        && path.is_char_boundary(path.len() - suffix_len)
        && path[path.len() - suffix_len..]
            .strip_prefix('.')
            .is_some_and(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
}
