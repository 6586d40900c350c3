use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability granted by a share.
///
/// Variants are declared in ascending order of capability so the derived
/// `Ord` encodes the hierarchy: an `Editor` can do everything a `Viewer` can.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShareRole {
    /// Read-only access.
    Viewer,
    /// Read and write access. Deleting still requires ownership.
    /// New shares default to this role when the client picks none.
    #[default]
    Editor,
}

impl ShareRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "VIEWER",
            Self::Editor => "EDITOR",
        }
    }

    /// Parse the stored representation. Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VIEWER" => Some(Self::Viewer),
            "EDITOR" => Some(Self::Editor),
            _ => None,
        }
    }
}

impl fmt::Display for ShareRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a principal holding `held` may perform an action requiring `required`.
pub fn satisfies(held: ShareRole, required: ShareRole) -> bool {
    held >= required
}
