use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a target actor.
///
/// Pending applications are keyed by this id, never by the display name,
/// since names are neither unique nor stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub u64);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A target actor as seen by the external services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub id: TargetId,
    pub name: String,
    /// Slot of the actor in the host's object table.
    pub object_index: u16,
}

impl TargetRef {
    pub fn new(id: u64, name: impl Into<String>, object_index: u16) -> Self {
        Self {
            id: TargetId(id),
            name: name.into(),
            object_index,
        }
    }

    /// Owner segment for staging file names: the id, which is always filesystem safe.
    pub fn staging_owner(&self) -> String {
        self.id.to_string()
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.id)
    }
}

/// How much of an archive or payload is applied to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ApplicationKind {
    /// Mods, appearance, body scale and title.
    #[default]
    EntireAppearance,
    /// Appearance payload only.
    OnlyGlamourerData,
    /// Body-scale payload only.
    OnlyCustomizeData,
    /// Mod files and manipulation data only.
    OnlyModData,
    /// Everything, but keep the target's race and clan.
    PreserveRace,
    /// Everything, but keep the target's gender traits.
    PreserveGenderTraits,
    /// Everything, but keep all of the target's physical customization.
    PreservePhysicalTraits,
}

impl ApplicationKind {
    pub fn applies_mods(self) -> bool {
        !matches!(self, Self::OnlyGlamourerData | Self::OnlyCustomizeData)
    }

    pub fn applies_appearance(self) -> bool {
        !matches!(self, Self::OnlyCustomizeData | Self::OnlyModData)
    }

    pub fn applies_body_scale(self) -> bool {
        !matches!(self, Self::OnlyGlamourerData | Self::OnlyModData)
    }

    pub fn applies_title(self) -> bool {
        matches!(
            self,
            Self::EntireAppearance
                | Self::PreserveRace
                | Self::PreserveGenderTraits
                | Self::PreservePhysicalTraits
        )
    }

    /// Whether the target has to be redrawn after applying.
    pub fn needs_redraw(self) -> bool {
        self.applies_mods() || self.applies_appearance()
    }

    pub fn preserves_traits(self) -> bool {
        matches!(
            self,
            Self::PreserveRace | Self::PreserveGenderTraits | Self::PreservePhysicalTraits
        )
    }
}
