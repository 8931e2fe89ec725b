use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DarnerError, Result};

/// How index volumes are maintained alongside Blocks volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IndexFilePolicy {
    /// No index volumes at all.
    None,
    /// Index volumes map blocks to their home volume.
    Lookup,
    /// Lookup plus embedded blocklist payloads.
    #[default]
    Full,
}

impl IndexFilePolicy {
    /// Parse from a config string like "none", "lookup", "full".
    pub fn from_config(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(IndexFilePolicy::None),
            "lookup" => Ok(IndexFilePolicy::Lookup),
            "full" => Ok(IndexFilePolicy::Full),
            other => Err(DarnerError::Config(format!(
                "unknown index file policy: {other}"
            ))),
        }
    }
}

/// Options controlling a repair run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairOptions {
    /// Path to the local state database file.
    pub dbpath: PathBuf,

    /// Diagnose only; no remote write, no database mutation.
    #[serde(default)]
    pub dry_run: bool,

    /// Filename prefix scoping this repository inside a shared folder.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Maximum block size in bytes.
    #[serde(default = "default_blocksize")]
    pub blocksize: usize,

    /// Block hash algorithm id ("sha256", "blake2b256").
    #[serde(default = "default_block_hash_algorithm")]
    pub block_hash_algorithm: String,

    /// Compression module id used for newly written volumes.
    #[serde(default = "default_compression_module")]
    pub compression_module: String,

    #[serde(default)]
    pub index_file_policy: IndexFilePolicy,

    /// Opt-in for rebuilding missing Blocks volumes from whatever sources
    /// remain. Rebuilding may fail, so it is never attempted silently.
    #[serde(default)]
    pub rebuild_missing_block_volumes: bool,

    /// Proceed (with a warning) when the remote store holds filesets newer
    /// than anything in the local database.
    #[serde(default)]
    pub repair_ignore_outdated_database: bool,

    /// Must be false; the repair engine cannot re-encrypt volumes.
    #[serde(default)]
    pub allow_passphrase_change: bool,

    /// Extra files attached to every rebuilt Files volume.
    #[serde(default)]
    pub control_files: Vec<PathBuf>,

    /// Upload a `<prefix>-verification.json` manifest after a successful
    /// non-dry-run repair.
    #[serde(default)]
    pub upload_verification_file: bool,

    /// Restore point handed to the recreate handler; the repair engine never
    /// filters by version itself.
    #[serde(default)]
    pub version_time: Option<DateTime<Utc>>,
}

impl RepairOptions {
    pub fn new(dbpath: impl Into<PathBuf>) -> Self {
        Self {
            dbpath: dbpath.into(),
            dry_run: false,
            prefix: default_prefix(),
            blocksize: default_blocksize(),
            block_hash_algorithm: default_block_hash_algorithm(),
            compression_module: default_compression_module(),
            index_file_policy: IndexFilePolicy::default(),
            rebuild_missing_block_volumes: false,
            repair_ignore_outdated_database: false,
            allow_passphrase_change: false,
            control_files: Vec::new(),
            upload_verification_file: false,
            version_time: None,
        }
    }
}

/// A path filter used when re-populating fileset rows.
/// An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    patterns: Vec<String>,
}

impl PathFilter {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    /// Substring match against any pattern; empty filter accepts all paths.
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| path.contains(p.as_str()))
    }
}

fn default_prefix() -> String {
    "darner".to_string()
}

fn default_blocksize() -> usize {
    100 * 1024
}

fn default_block_hash_algorithm() -> String {
    "sha256".to_string()
}

fn default_compression_module() -> String {
    "zstd".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_policy_from_config() {
        assert_eq!(
            IndexFilePolicy::from_config("full").unwrap(),
            IndexFilePolicy::Full
        );
        assert_eq!(
            IndexFilePolicy::from_config("none").unwrap(),
            IndexFilePolicy::None
        );
        assert!(IndexFilePolicy::from_config("zip").is_err());
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = PathFilter::empty();
        assert!(filter.matches("/any/path"));
        assert!(filter.matches(""));
    }

    #[test]
    fn filter_matches_substring() {
        let filter = PathFilter::new(vec!["photos".into()]);
        assert!(filter.matches("/home/user/photos/a.jpg"));
        assert!(!filter.matches("/home/user/docs/a.txt"));
    }
}
