//! Content hashing.
//!
//! Content hashes are SHA-1 digests rendered as 40 upper-case hex characters.
//! Files that another process holds an exclusive lock on are polled with
//! exponential backoff before they are read.

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, Read};

use crate::config::LockRetryConfig;
use crate::entry::{modified_ticks, FileCacheEntry};
use crate::error::{Error, Result};

/// Length of a rendered content hash.
pub const HASH_LENGTH: usize = 40;

/// Windows reports sharing violations on open instead of on lock.
const ERROR_SHARING_VIOLATION: i32 = 32;

/// Hash an in-memory buffer.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(bytes))
}

/// Hash everything `reader` yields.
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode_upper(hasher.finalize()))
}

/// Whether `value` looks like a rendered content hash.
pub fn is_content_hash(value: &str) -> bool {
    value.len() == HASH_LENGTH && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Hashes files on disk, waiting for foreign locks to clear first.
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    retry: LockRetryConfig,
}

impl ContentHasher {
    pub fn new(retry: LockRetryConfig) -> Self {
        Self { retry }
    }

    /// Hash the file at `path`.
    ///
    /// Fails with [`Error::FileLocked`] when the file stays locked for the whole
    /// retry budget, and with [`Error::Io`] when it cannot be opened or read.
    pub fn hash_file(&self, path: &Utf8Path) -> Result<String> {
        let mut file = self.open_unlocked(path)?;
        let result = hash_reader(&mut file);
        if let Err(e) = FileExt::unlock(&file) {
            tracing::warn!(%path, error = %e, "Failed to release shared lock");
        }
        Ok(result?)
    }

    /// Hash `path` and stamp its modification time.
    pub fn create_entry(&self, path: &Utf8Path) -> Result<FileCacheEntry> {
        let hash = self.hash_file(path)?;
        let ticks = modified_ticks(path)?;
        tracing::debug!(%path, %hash, "hashed file");
        Ok(FileCacheEntry::new(hash, path.to_owned(), ticks))
    }

    /// Open `path` and take a shared lock, backing off while someone else holds it exclusively.
    fn open_unlocked(&self, path: &Utf8Path) -> Result<File> {
        let mut attempt = 0u32;
        loop {
            match try_open_shared(path) {
                Ok(Some(file)) => return Ok(file),
                Ok(None) => {}
                Err(e) => return Err(Error::Io(e)),
            }

            if attempt >= self.retry.max_attempts {
                tracing::warn!(%path, attempts = attempt, "file stayed locked");
                return Err(Error::FileLocked(Utf8PathBuf::from(path)));
            }

            let delay = self.retry.backoff(attempt);
            tracing::trace!(%path, ?delay, "file is locked, waiting");
            std::thread::sleep(delay);
            attempt += 1;
        }
    }
}

/// `Ok(None)` means the file exists but is locked by someone else.
fn try_open_shared(path: &Utf8Path) -> io::Result<Option<File>> {
    let file = match File::open(path.as_std_path()) {
        Ok(file) => file,
        Err(e) if e.raw_os_error() == Some(ERROR_SHARING_VIOLATION) && cfg!(windows) => {
            return Ok(None)
        }
        Err(e) => return Err(e),
    };

    match FileExt::try_lock_shared(&file) {
        Ok(()) => Ok(Some(file)),
        Err(e) if is_contended(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
