use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{DarnerError, Result};

/// Read granularity for whole-file hashing.
const FILE_HASH_CHUNK: usize = 8 * 1024 * 1024;

/// Block and volume hash algorithms, resolved by string id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake2b256,
}

impl HashAlgorithm {
    /// Parse from a config string like "sha256" or "blake2b256".
    pub fn from_config(id: &str) -> Result<Self> {
        match id {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "blake2b256" => Ok(HashAlgorithm::Blake2b256),
            other => Err(DarnerError::UnknownHashAlgorithm(other.to_string())),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake2b256 => "blake2b256",
        }
    }

    /// Raw digest width in bytes.
    pub fn digest_len(&self) -> usize {
        32
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(data);
                hasher.finalize().to_vec()
            }
            HashAlgorithm::Blake2b256 => {
                use blake2::digest::{Update, VariableOutput};
                use blake2::Blake2bVar;
                let mut hasher = Blake2bVar::new(32).expect("32 is a valid BLAKE2b output size");
                hasher.update(data);
                let mut out = vec![0u8; 32];
                hasher
                    .finalize_variable(&mut out)
                    .expect("output length matches");
                out
            }
        }
    }

    /// Base64 (standard alphabet) of the digest — the textual form every
    /// block and volume hash uses.
    pub fn hash_base64(&self, data: &[u8]) -> String {
        BASE64.encode(self.digest(data))
    }

    /// Stream a whole file through the hasher. Returns (base64 digest, size).
    pub fn hash_file(&self, path: &Path) -> Result<(String, i64)> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; FILE_HASH_CHUNK];
        let mut size: i64 = 0;

        match self {
            HashAlgorithm::Sha256 => {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    size += n as i64;
                }
                Ok((BASE64.encode(hasher.finalize()), size))
            }
            HashAlgorithm::Blake2b256 => {
                use blake2::digest::{Update, VariableOutput};
                use blake2::Blake2bVar;
                let mut hasher = Blake2bVar::new(32).expect("32 is a valid BLAKE2b output size");
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    size += n as i64;
                }
                let mut out = vec![0u8; 32];
                hasher
                    .finalize_variable(&mut out)
                    .expect("output length matches");
                Ok((BASE64.encode(out), size))
            }
        }
    }
}

/// Decode a base64 block hash back to its raw digest bytes.
pub fn decode_hash(hash: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(hash)
        .map_err(|e| DarnerError::InvalidFormat(format!("bad base64 hash '{hash}': {e}")))
}

/// Encode raw digest bytes as a base64 block hash.
pub fn encode_hash(digest: &[u8]) -> String {
    BASE64.encode(digest)
}
