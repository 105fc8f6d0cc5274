//! Archive reading and extraction into staging files.

use camino::{Utf8Path, Utf8PathBuf};
use mcdf_format::{ArchiveDescriptor, ArchiveReader, ContainerFileRecord};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Number of hash characters used in staging file names.
const STAGING_HASH_PREFIX: usize = 16;

/// An archive whose header has been read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedArchive {
    pub path: Utf8PathBuf,
    pub descriptor: ArchiveDescriptor,
    /// Total body bytes the header declares.
    pub expected_bytes: u64,
}

/// Staging files produced by an extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedFiles {
    /// Game path to staged file.
    pub mappings: BTreeMap<String, Utf8PathBuf>,
    /// Every staging file, one per record.
    pub files: Vec<Utf8PathBuf>,
}

impl StagedFiles {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Delete every staging file. Returns how many were removed.
    pub fn remove_all(&self) -> usize {
        let mut removed = 0;
        for file in &self.files {
            match std::fs::remove_file(file.as_std_path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %file, error = %e, "Failed to delete staging file"),
            }
        }
        tracing::debug!(removed, total = self.files.len(), "Removed staging files");
        removed
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveLoader {
    staging_folder: Utf8PathBuf,
}

impl ArchiveLoader {
    pub fn new(staging_folder: impl Into<Utf8PathBuf>) -> Self {
        Self {
            staging_folder: staging_folder.into(),
        }
    }

    pub fn staging_folder(&self) -> &Utf8Path {
        &self.staging_folder
    }

    /// Read only the header of the archive at `path`.
    pub fn read_header(&self, path: &Utf8Path) -> Result<LoadedArchive> {
        let mut reader = ArchiveReader::open(path)?;
        let descriptor = reader.read_header()?;
        let expected_bytes = descriptor.expected_body_len();
        tracing::info!(
            %path,
            version = descriptor.version,
            description = %descriptor.description,
            files = descriptor.files.len(),
            expected_bytes,
            "Read archive header"
        );
        Ok(LoadedArchive {
            path: path.to_owned(),
            descriptor,
            expected_bytes,
        })
    }

    pub async fn read_header_async(&self, path: Utf8PathBuf) -> Result<LoadedArchive> {
        let loader = self.clone();
        tokio::task::spawn_blocking(move || loader.read_header(&path)).await?
    }

    /// Staging file for record number `ordinal` of an extraction owned by
    /// `owner`. `fingerprint` is the archive's [`ArchiveDescriptor::fingerprint`].
    pub fn staging_path(
        &self,
        owner: &str,
        fingerprint: u64,
        ordinal: usize,
        record: &ContainerFileRecord,
    ) -> Utf8PathBuf {
        let prefix: String = record
            .hash
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(STAGING_HASH_PREFIX)
            .collect();
        self.staging_folder
            .join(format!("mcdf_{owner}_{fingerprint:016x}_{ordinal}_{prefix}.tmp"))
    }

    /// Extract every record of `archive` into the staging folder.
    ///
    /// The file is reopened and the header skipped; records are streamed in
    /// table order. A staging file that already exists with the declared
    /// length is reused and its bytes skipped. On failure the staging files of
    /// this extraction are removed before the error is returned; on success
    /// the caller owns them.
    pub fn extract(
        &self,
        archive: &LoadedArchive,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<StagedFiles> {
        std::fs::create_dir_all(self.staging_folder.as_std_path())?;

        let mut staged = StagedFiles::default();
        match self.extract_into(archive, owner, cancel, &mut staged) {
            Ok(()) => {
                tracing::info!(
                    archive = %archive.path,
                    files = staged.files.len(),
                    mappings = staged.mappings.len(),
                    "Extracted archive"
                );
                Ok(staged)
            }
            Err(e) => {
                tracing::error!(archive = %archive.path, error = %e, "Extraction failed");
                staged.remove_all();
                Err(e)
            }
        }
    }

    fn extract_into(
        &self,
        archive: &LoadedArchive,
        owner: &str,
        cancel: &CancellationToken,
        staged: &mut StagedFiles,
    ) -> Result<()> {
        let fingerprint = archive.descriptor.fingerprint()?;
        let mut reader = ArchiveReader::open(&archive.path)?;
        reader.advance_to_body()?;

        for (ordinal, record) in archive.descriptor.files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let path = self.staging_path(owner, fingerprint, ordinal, record);
            let length = record.byte_len();
            staged.files.push(path.clone());

            if existing_len(&path) == Some(length) {
                tracing::debug!(%path, length, "Reusing staging file");
                reader.skip_record(length)?;
            } else {
                write_staging(&mut reader, &path, length)?;
                tracing::debug!(%path, length, hash = %record.hash, "Staged record");
            }

            for game_path in &record.game_paths {
                staged.mappings.insert(game_path.clone(), path.clone());
            }
        }
        Ok(())
    }

    pub async fn extract_async(
        &self,
        archive: LoadedArchive,
        owner: String,
        cancel: CancellationToken,
    ) -> Result<StagedFiles> {
        let loader = self.clone();
        tokio::task::spawn_blocking(move || loader.extract(&archive, &owner, &cancel)).await?
    }
}

fn existing_len(path: &Utf8Path) -> Option<u64> {
    std::fs::metadata(path.as_std_path())
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

fn write_staging(reader: &mut ArchiveReader<File>, path: &Utf8Path, length: u64) -> Result<()> {
    let file = File::create(path.as_std_path())?;
    let mut out = BufWriter::new(file);
    reader.copy_record(length, &mut out)?;
    out.flush()?;
    Ok(())
}
