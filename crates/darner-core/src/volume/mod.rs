pub mod name;
pub mod payload;
pub mod writer;

use serde::{Deserialize, Serialize};

/// The three kinds of remote volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeKind {
    /// Raw deduplicated block payloads.
    Blocks,
    /// Maps one or more Blocks volumes to the blocks inside them.
    Index,
    /// One snapshot: files, metadata, block sequences.
    Files,
}

impl VolumeKind {
    /// Single-letter filename tag.
    pub fn letter(&self) -> char {
        match self {
            VolumeKind::Blocks => 'b',
            VolumeKind::Index => 'i',
            VolumeKind::Files => 'f',
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'b' => Some(VolumeKind::Blocks),
            'i' => Some(VolumeKind::Index),
            'f' => Some(VolumeKind::Files),
            _ => None,
        }
    }
}

/// Lifecycle state of a remote volume as tracked by the local database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    /// Registered locally, not yet handed to the backend.
    Temporary,
    /// Handed to the backend; the upload may not have completed.
    Uploading,
    /// The backend reported the upload complete.
    Uploaded,
    /// Size and hash have been confirmed against the remote bytes.
    Verified,
    /// A delete was issued; the remote object may still exist.
    Deleting,
    Deleted,
}

impl VolumeState {
    /// States in which the remote object is expected to exist durably.
    pub fn is_durable(&self) -> bool {
        matches!(self, VolumeState::Uploaded | VolumeState::Verified)
    }
}
