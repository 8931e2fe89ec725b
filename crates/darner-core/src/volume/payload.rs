use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::compress::{self, Codec};
use crate::error::{DarnerError, Result};

/// Magic bytes at the start of every volume file.
pub const VOLUME_MAGIC: &[u8; 8] = b"DARNRVOL";
/// Volume format version.
pub const VOLUME_VERSION: u8 = 1;

/// A single block stored in a Blocks volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Base64 digest under the repository's block hash algorithm.
    pub hash: String,
    pub data: Vec<u8>,
}

/// Payload of a Blocks volume: the raw deduplicated block bodies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlocksPayload {
    pub blocks: Vec<BlockRecord>,
}

/// One Blocks volume described by an Index volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexVolumeEntry {
    pub volume_name: String,
    pub volume_hash: String,
    pub volume_size: i64,
    /// (block hash, block size) for every block in the volume.
    pub blocks: Vec<(String, i64)>,
}

/// A blocklist payload carried inside an Index volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistRecord {
    pub hash: String,
    /// Concatenated fixed-width raw block digests.
    pub data: Vec<u8>,
}

/// Payload of an Index volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexPayload {
    pub volumes: Vec<IndexVolumeEntry>,
    pub blocklists: Vec<BlocklistRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Folder,
    Symlink,
}

/// One file entry in a Files volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub file_type: FileType,
    pub size: i64,
    /// Hash of the serialized filesystem metadata.
    pub meta_hash: String,
    pub metadata: Vec<u8>,
    /// Ordered block hashes reconstructing the content. A file no larger
    /// than one block has exactly one entry and no blocklist hash.
    pub block_hashes: Vec<String>,
    pub blocklist_hash: Option<String>,
}

/// Payload of a Files volume: one snapshot manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesetPayload {
    pub time: DateTime<Utc>,
    pub is_full_backup: bool,
    pub files: Vec<FileRecord>,
    /// Operator-supplied control files carried alongside the manifest.
    pub control_files: Vec<(String, Vec<u8>)>,
}

/// Serialize a payload through the codec into the volume envelope.
pub fn write_payload<T: Serialize>(payload: &T, codec: Codec, out: &mut impl Write) -> Result<()> {
    let body = rmp_serde::to_vec(payload)?;
    let compressed = codec.compress(&body)?;
    out.write_all(VOLUME_MAGIC)?;
    out.write_all(&[VOLUME_VERSION])?;
    out.write_all(&compressed)?;
    Ok(())
}

/// Read a volume file back into its payload, validating the envelope.
pub fn read_payload<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; 9];
    file.read_exact(&mut header).map_err(|_| {
        DarnerError::InvalidFormat(format!("volume file too short: {}", path.display()))
    })?;
    if &header[..8] != VOLUME_MAGIC {
        return Err(DarnerError::InvalidFormat(format!(
            "bad volume magic in {}",
            path.display()
        )));
    }
    if header[8] != VOLUME_VERSION {
        return Err(DarnerError::InvalidFormat(format!(
            "unsupported volume version {} in {}",
            header[8],
            path.display()
        )));
    }
    let mut compressed = Vec::new();
    file.read_to_end(&mut compressed)?;
    let body = compress::decompress(&compressed)?;
    Ok(rmp_serde::from_slice(&body)?)
}
