use std::io::Write;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::config::RepairOptions;
use crate::db::LocalStateDatabase;
use crate::error::Result;
use crate::storage::Backend;
use crate::volume::VolumeState;

/// One entry in the remote verification manifest. Field names match the
/// external audit tooling, which reads the JSON without this codebase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationEntry {
    #[serde(rename = "Name")]
    pub name: String,
    /// Base64 SHA-256 of the whole file.
    #[serde(rename = "Hash")]
    pub hash: String,
    #[serde(rename = "Size")]
    pub size: i64,
}

/// The manifest's remote name: `<prefix>-verification.json`.
pub fn verification_name(prefix: &str) -> String {
    format!("{prefix}-verification.json")
}

/// Collect every durably-stored volume with a known identity.
pub fn build_manifest(db: &LocalStateDatabase) -> Vec<VerificationEntry> {
    let mut entries: Vec<VerificationEntry> = db
        .remote_volumes()
        .iter()
        .filter(|v| matches!(v.state, VolumeState::Uploaded | VolumeState::Verified))
        .filter_map(|v| {
            v.hash.as_ref().map(|hash| VerificationEntry {
                name: v.name.clone(),
                hash: hash.clone(),
                size: v.size,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// Write the manifest next to the volumes so an external script can audit
/// the store without the local database.
pub fn upload_verification_file(
    backend: &dyn Backend,
    db: &LocalStateDatabase,
    options: &RepairOptions,
) -> Result<()> {
    let entries = build_manifest(db);
    let mut file = NamedTempFile::new()?;
    serde_json::to_writer_pretty(file.as_file_mut(), &entries)?;
    file.as_file_mut().flush()?;

    let name = verification_name(&options.prefix);
    backend.put(&name, file.path())?;
    backend.wait_for_empty()?;
    info!(name = name.as_str(), volumes = entries.len(), "uploaded verification manifest");
    Ok(())
}
