//! Character state captured from a live target, the input of archive creation.

use serde::{Deserialize, Serialize};

/// One replaced game file: either content addressed by hash or a swap to
/// another game path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReplacement {
    pub game_paths: Vec<String>,
    /// Content hash; empty for pure swaps.
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_swap_path: Option<String>,
}

impl FileReplacement {
    pub fn content(hash: impl Into<String>, game_paths: Vec<String>) -> Self {
        Self {
            game_paths,
            hash: hash.into(),
            file_swap_path: None,
        }
    }

    pub fn swap(game_paths: Vec<String>, swap_path: impl Into<String>) -> Self {
        Self {
            game_paths,
            hash: String::new(),
            file_swap_path: Some(swap_path.into()),
        }
    }

    pub fn is_swap(&self) -> bool {
        self.file_swap_path
            .as_deref()
            .is_some_and(|path| !path.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterSnapshot {
    pub appearance_payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_scale_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub manipulation_data: Vec<u8>,
    pub file_replacements: Vec<FileReplacement>,
}

impl CharacterSnapshot {
    pub fn new(appearance_payload: impl Into<String>) -> Self {
        Self {
            appearance_payload: appearance_payload.into(),
            ..Default::default()
        }
    }

    pub fn with_replacement(mut self, replacement: FileReplacement) -> Self {
        self.file_replacements.push(replacement);
        self
    }
}
