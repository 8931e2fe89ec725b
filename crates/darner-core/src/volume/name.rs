use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;

use crate::error::{DarnerError, Result};

use super::VolumeKind;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Width of the base32 timestamp field: 13 chars * 5 bits >= 64 bits.
const TIMESTAMP_WIDTH: usize = 13;

/// Width of the random hex suffix (8 random bytes).
const RANDOM_WIDTH: usize = 16;

/// A parsed remote volume name.
///
/// The filename is the only identity and the only metadata source for
/// timestamp, kind, and module ids; archive bytes are never consulted.
/// `format` and `parse_with_prefix` are inverse on well-formed names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeName {
    pub prefix: String,
    pub kind: VolumeKind,
    pub time: DateTime<Utc>,
    pub random: String,
    pub codec: String,
    pub encryption: Option<String>,
}

impl VolumeName {
    /// Create a fresh name with a random suffix and the current grammar.
    pub fn generate(prefix: &str, kind: VolumeKind, time: DateTime<Utc>, codec: &str) -> Self {
        let mut suffix = [0u8; RANDOM_WIDTH / 2];
        rand::thread_rng().fill_bytes(&mut suffix);
        Self {
            prefix: prefix.to_string(),
            kind,
            time,
            random: hex::encode(suffix),
            codec: codec.to_string(),
            encryption: None,
        }
    }

    /// Render the remote filename.
    pub fn format(&self) -> String {
        let stamp = encode_timestamp(self.time);
        let mut name = format!(
            "{}-{}{}-{}.{}",
            self.prefix,
            self.kind.letter(),
            stamp,
            self.random,
            self.codec
        );
        if let Some(enc) = &self.encryption {
            name.push('.');
            name.push_str(enc);
        }
        name
    }
}

/// Parse a remote filename under a known prefix.
pub fn parse_with_prefix(name: &str, prefix: &str) -> Option<VolumeName> {
    let parsed = parse_any(name)?;
    (parsed.prefix == prefix).then_some(parsed)
}

/// Parse a remote filename without knowing the prefix (used to discover
/// foreign prefixes sharing the folder). Prefixes must not contain dots.
pub fn parse_any(name: &str) -> Option<VolumeName> {
    let mut dotted = name.split('.');
    let stem = dotted.next()?;
    let codec = dotted.next()?;
    let encryption = dotted.next();
    if dotted.next().is_some() {
        return None;
    }
    if codec.is_empty() || !codec.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    if let Some(enc) = encryption {
        if enc.is_empty() || !enc.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
    }

    let (head, random) = stem.rsplit_once('-')?;
    if random.len() != RANDOM_WIDTH
        || !random
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    {
        return None;
    }

    // head = <prefix>-<kindLetter><13 base32 chars>
    if head.len() < 2 + TIMESTAMP_WIDTH + 1 {
        return None;
    }
    let tail_start = head.len() - (1 + TIMESTAMP_WIDTH);
    if head.as_bytes()[tail_start - 1] != b'-' {
        return None;
    }
    let prefix = &head[..tail_start - 1];
    if prefix.is_empty() {
        return None;
    }
    let tail = &head[tail_start..];
    let kind = VolumeKind::from_letter(tail.chars().next()?)?;
    let time = decode_timestamp(&tail[1..]).ok()?;

    Some(VolumeName {
        prefix: prefix.to_string(),
        kind,
        time,
        random: random.to_string(),
        codec: codec.to_string(),
        encryption: encryption.map(str::to_string),
    })
}

/// Encode a UTC instant as 13 base32 chars of its millisecond count.
fn encode_timestamp(time: DateTime<Utc>) -> String {
    let millis = time.timestamp_millis().max(0) as u64;
    let mut out = vec![b'A'; TIMESTAMP_WIDTH];
    let mut value = millis;
    for slot in out.iter_mut().rev() {
        *slot = BASE32_ALPHABET[(value & 0x1F) as usize];
        value >>= 5;
    }
    String::from_utf8(out).expect("alphabet is ASCII")
}

/// Decode the 13-char base32 timestamp field.
fn decode_timestamp(stamp: &str) -> Result<DateTime<Utc>> {
    if stamp.len() != TIMESTAMP_WIDTH {
        return Err(DarnerError::InvalidVolumeName(stamp.to_string()));
    }
    let mut value: u128 = 0;
    for ch in stamp.bytes() {
        let digit = BASE32_ALPHABET
            .iter()
            .position(|&a| a == ch)
            .ok_or_else(|| DarnerError::InvalidVolumeName(stamp.to_string()))?;
        value = (value << 5) | digit as u128;
    }
    // 13 base32 chars span 65 bits; reject the values a u64 cannot hold.
    let millis = i64::try_from(value)
        .map_err(|_| DarnerError::InvalidVolumeName(stamp.to_string()))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| DarnerError::InvalidVolumeName(stamp.to_string()))
}
