//! In-memory description of a chara archive.
//!
//! An [`ArchiveDescriptor`] is everything stored in the archive header: the
//! appearance payloads, the manipulation blob, the file table and the swap
//! table. The file contents themselves live in the archive body, in the same
//! order as [`ArchiveDescriptor::files`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use xxhash_rust::xxh3::xxh3_64;

use crate::CURRENT_VERSION;

/// Auxiliary payload key for the body-scale (customization) payload.
pub const AUX_BODY_SCALE: &str = "bodyScale";

/// Auxiliary payload key for the character title payload.
pub const AUX_TITLE: &str = "title";

/// One physical blob in the archive body and every game path it maps to.
///
/// Records are deduplicated by content hash, so several game paths may share
/// a single blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerFileRecord {
    /// Content hash of the blob (upper-case hex SHA-1).
    pub hash: String,
    /// Number of bytes the blob occupies in the body.
    pub length: i32,
    /// Game paths resolved to this blob, in insertion order.
    pub game_paths: Vec<String>,
}

impl ContainerFileRecord {
    pub fn new(hash: impl Into<String>, length: i32) -> Self {
        Self {
            hash: hash.into(),
            length,
            game_paths: Vec::new(),
        }
    }

    /// Append a game path unless it is already mapped to this record.
    pub fn add_game_path(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.game_paths.contains(&path) {
            self.game_paths.push(path);
        }
    }

    /// Declared length as an unsigned byte count.
    pub fn byte_len(&self) -> u64 {
        self.length.max(0) as u64
    }
}

/// A redirect entry: the game paths resolve to an already present file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSwapRecord {
    pub game_paths: Vec<String>,
    pub file_swap_path: String,
}

/// Header contents of a chara archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveDescriptor {
    pub version: i32,
    pub description: String,
    /// Base64 appearance payload consumed by the appearance service.
    pub appearance_payload: String,
    /// Named opaque payloads such as [`AUX_BODY_SCALE`] and [`AUX_TITLE`].
    ///
    /// Only persisted by format version 2 and later.
    pub auxiliary_payloads: BTreeMap<String, String>,
    pub manipulation_data: Vec<u8>,
    pub files: Vec<ContainerFileRecord>,
    pub file_swaps: Vec<FileSwapRecord>,
}

impl Default for ArchiveDescriptor {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            description: String::new(),
            appearance_payload: String::new(),
            auxiliary_payloads: BTreeMap::new(),
            manipulation_data: Vec::new(),
            files: Vec::new(),
            file_swaps: Vec::new(),
        }
    }
}

impl ArchiveDescriptor {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    /// Sum of all declared record lengths, i.e. the expected body size.
    pub fn expected_body_len(&self) -> u64 {
        self.files.iter().map(ContainerFileRecord::byte_len).sum()
    }

    pub fn auxiliary(&self, key: &str) -> Option<&str> {
        self.auxiliary_payloads
            .get(key)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn body_scale_payload(&self) -> Option<&str> {
        self.auxiliary(AUX_BODY_SCALE)
    }

    pub fn title_payload(&self) -> Option<&str> {
        self.auxiliary(AUX_TITLE)
    }

    /// Game path to swap target for every file swap entry.
    pub fn swap_mappings(&self) -> BTreeMap<String, String> {
        let mut mappings = BTreeMap::new();
        for swap in &self.file_swaps {
            for path in &swap.game_paths {
                mappings.insert(path.clone(), swap.file_swap_path.clone());
            }
        }
        mappings
    }

    /// Stable xxHash3 fingerprint of the encoded header.
    ///
    /// Two descriptors with identical header contents produce the same
    /// fingerprint. The loader puts it in staging file names so records of
    /// different archives never share a staging file.
    pub fn fingerprint(&self) -> crate::Result<u64> {
        let encoded = crate::header::encode_header(self)?;
        Ok(xxh3_64(&encoded))
    }
}
