//! Archive creation from a character snapshot.
//!
//! [`ArchiveBuilder::build`] resolves every replaced file through the cache and
//! produces an [`ArchiveDescriptor`]; [`ArchiveBuilder::save`] streams the
//! descriptor and the referenced files into a compressed archive, writing to a
//! temporary file first and renaming it into place on success.

use camino::{Utf8Path, Utf8PathBuf};
use mcdf_cache::FileCacheStore;
use mcdf_format::{
    ArchiveDescriptor, ArchiveWriter, ContainerFileRecord, FileSwapRecord, AUX_BODY_SCALE,
    AUX_TITLE,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::snapshot::CharacterSnapshot;

#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    store: Arc<FileCacheStore>,
    compression_level: i32,
}

impl ArchiveBuilder {
    pub fn new(store: Arc<FileCacheStore>, compression_level: i32) -> Self {
        Self {
            store,
            compression_level,
        }
    }

    /// Build the descriptor for `snapshot`.
    ///
    /// Replacements sharing a content hash collapse into one record whose game
    /// paths are merged in first-seen order. Replacements with a swap path
    /// become swap records. Fails with [`Error::MissingSourceFile`] if a hash is
    /// not in the cache.
    pub fn build(&self, description: &str, snapshot: &CharacterSnapshot) -> Result<ArchiveDescriptor> {
        let mut descriptor = ArchiveDescriptor::new(description);
        descriptor.appearance_payload = snapshot.appearance_payload.clone();
        descriptor.manipulation_data = snapshot.manipulation_data.clone();

        if let Some(body_scale) = &snapshot.body_scale_payload {
            descriptor
                .auxiliary_payloads
                .insert(AUX_BODY_SCALE.to_string(), body_scale.clone());
        }
        if let Some(title) = &snapshot.title {
            descriptor
                .auxiliary_payloads
                .insert(AUX_TITLE.to_string(), title.clone());
        }

        let mut record_indices: HashMap<&str, usize> = HashMap::new();
        for replacement in &snapshot.file_replacements {
            if let Some(swap_path) = replacement.file_swap_path.as_deref().filter(|_| replacement.is_swap()) {
                descriptor.file_swaps.push(FileSwapRecord {
                    game_paths: replacement.game_paths.clone(),
                    file_swap_path: swap_path.to_string(),
                });
                continue;
            }
            if replacement.hash.is_empty() {
                tracing::debug!(paths = ?replacement.game_paths, "Skipping replacement without content");
                continue;
            }

            let index = match record_indices.get(replacement.hash.as_str()) {
                Some(&index) => index,
                None => {
                    let record = self.resolve(&replacement.hash, &replacement.game_paths)?;
                    descriptor.files.push(record);
                    record_indices.insert(replacement.hash.as_str(), descriptor.files.len() - 1);
                    descriptor.files.len() - 1
                }
            };

            let record = &mut descriptor.files[index];
            for path in &replacement.game_paths {
                record.add_game_path(path.clone());
            }
        }

        tracing::info!(
            description,
            files = descriptor.files.len(),
            swaps = descriptor.file_swaps.len(),
            bytes = descriptor.expected_body_len(),
            "Built archive descriptor"
        );
        Ok(descriptor)
    }

    /// Look up `hash` and create an empty record of the cached file's length.
    fn resolve(&self, hash: &str, game_paths: &[String]) -> Result<ContainerFileRecord> {
        let (path, size) = self.source_for(hash, game_paths)?;
        let length = i32::try_from(size).map_err(|_| Error::FileTooLarge { path, size })?;
        Ok(ContainerFileRecord::new(hash, length))
    }

    fn source_for(&self, hash: &str, game_paths: &[String]) -> Result<(Utf8PathBuf, u64)> {
        let missing = || Error::MissingSourceFile {
            hash: hash.to_string(),
            game_paths: game_paths.to_vec(),
        };
        let entry = self.store.lookup(hash).ok_or_else(missing)?;
        let metadata = std::fs::metadata(entry.path.as_std_path()).map_err(|_| missing())?;
        Ok((entry.path, metadata.len()))
    }

    /// Write `descriptor` and the content of its records to `dest`.
    ///
    /// The archive is written to `<dest>.tmp` and renamed on success; on any
    /// failure the temporary file is removed and `dest` is left untouched.
    pub fn save(&self, descriptor: &ArchiveDescriptor, dest: &Utf8Path) -> Result<()> {
        let tmp = Utf8PathBuf::from(format!("{dest}.tmp"));
        if let Some(parent) = dest.parent() {
            if !parent.as_str().is_empty() {
                std::fs::create_dir_all(parent.as_std_path())?;
            }
        }

        tracing::info!(%dest, files = descriptor.files.len(), "Saving archive");
        match self.write_to(descriptor, &tmp) {
            Ok(()) => {
                std::fs::rename(tmp.as_std_path(), dest.as_std_path()).inspect_err(|_| {
                    let _ = std::fs::remove_file(tmp.as_std_path());
                })?;
                tracing::info!(%dest, "Archive saved");
                Ok(())
            }
            Err(e) => {
                tracing::error!(%dest, error = %e, "Failed to save archive");
                let _ = std::fs::remove_file(tmp.as_std_path());
                Err(e)
            }
        }
    }

    fn write_to(&self, descriptor: &ArchiveDescriptor, tmp: &Utf8Path) -> Result<()> {
        let file = File::create(tmp.as_std_path())?;
        let mut writer = ArchiveWriter::new(BufWriter::new(file), descriptor, self.compression_level)?;

        for record in &descriptor.files {
            let (path, size) = self.source_for(&record.hash, &record.game_paths)?;
            if size != record.byte_len() {
                // The cached file changed since the descriptor was built.
                return Err(Error::MissingSourceFile {
                    hash: record.hash.clone(),
                    game_paths: record.game_paths.clone(),
                });
            }
            let mut source = File::open(path.as_std_path())?;
            writer.write_record(&mut source)?;
            tracing::debug!(hash = %record.hash, %path, length = record.length, "Wrote record");
        }

        let file = writer
            .finish()?
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(())
    }

    /// [`ArchiveBuilder::save`] on the blocking pool.
    pub async fn save_async(&self, descriptor: ArchiveDescriptor, dest: Utf8PathBuf) -> Result<()> {
        let builder = self.clone();
        tokio::task::spawn_blocking(move || builder.save(&descriptor, &dest)).await?
    }

    /// Build and save in one go.
    pub async fn export(
        &self,
        description: &str,
        snapshot: &CharacterSnapshot,
        dest: Utf8PathBuf,
    ) -> Result<ArchiveDescriptor> {
        let descriptor = self.build(description, snapshot)?;
        self.save_async(descriptor.clone(), dest).await?;
        Ok(descriptor)
    }
}
