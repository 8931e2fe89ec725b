use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{DarnerError, Result};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Maximum decompressed payload size. A volume payload holds at most one
/// archive's worth of blocks, so anything past this is a decompression bomb.
const MAX_DECOMPRESS_SIZE: u64 = 256 * 1024 * 1024;

const ZSTD_LEVEL: i32 = 3;

/// Compression modules, resolved by string id. The id is embedded in remote
/// volume filenames, so it is part of the repository's external surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Codec {
    None,
    Lz4,
    #[default]
    Zstd,
}

impl Codec {
    /// Resolve a codec by its filename id. Fails with the module-load error
    /// the repair surface reports for unknown ids.
    pub fn from_id(id: &str) -> Result<Self> {
        match id {
            "none" => Ok(Codec::None),
            "lz4" => Ok(Codec::Lz4),
            "zstd" => Ok(Codec::Zstd),
            other => Err(DarnerError::FailedToLoadCompressionModule(other.to_string())),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Lz4 => "lz4",
            Codec::Zstd => "zstd",
        }
    }

    /// Compress data and prepend a 1-byte tag identifying the codec.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::None => {
                let mut out = Vec::with_capacity(1 + data.len());
                out.push(TAG_NONE);
                out.extend_from_slice(data);
                Ok(out)
            }
            Codec::Lz4 => {
                let compressed = lz4_flex::compress_prepend_size(data);
                let mut out = Vec::with_capacity(1 + compressed.len());
                out.push(TAG_LZ4);
                out.extend_from_slice(&compressed);
                Ok(out)
            }
            Codec::Zstd => {
                let compressed = zstd::stream::encode_all(data, ZSTD_LEVEL)
                    .map_err(|e| DarnerError::Other(format!("zstd compress: {e}")))?;
                let mut out = Vec::with_capacity(1 + compressed.len());
                out.push(TAG_ZSTD);
                out.extend_from_slice(&compressed);
                Ok(out)
            }
        }
    }
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
/// The tag is authoritative; the filename codec id is not consulted here.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(DarnerError::Decompression("empty payload".into()));
    }
    let tag = data[0];
    let payload = &data[1..];
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            if payload.len() < 4 {
                return Err(DarnerError::Decompression("lz4: payload too short".into()));
            }
            let uncompressed_size = u32::from_le_bytes(payload[..4].try_into().unwrap()) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(DarnerError::Decompression(format!(
                    "lz4: declared size {uncompressed_size} exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| DarnerError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| DarnerError::Decompression(format!("zstd init: {e}")))?;
            let mut output = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| DarnerError::Decompression(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(DarnerError::Decompression(format!(
                    "zstd: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
        _ => Err(DarnerError::UnknownCompressionTag(tag)),
    }
}
