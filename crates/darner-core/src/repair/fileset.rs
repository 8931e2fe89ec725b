use tracing::{info, warn};

use crate::config::{PathFilter, RepairOptions};
use crate::db::{FileEntryRow, FilesetId, LocalStateDatabase};
use crate::error::{DarnerError, Result};
use crate::storage::Backend;
use crate::volume::name::parse_with_prefix;
use crate::volume::payload::{read_payload, FilesetPayload};
use crate::volume::writer::{ClosedVolume, FilesetVolumeWriter};
use crate::compress::Codec;

/// Serialize a fileset from the database into a Files volume under the given
/// remote name, attaching any configured control files.
pub fn build_fileset_volume(
    db: &LocalStateDatabase,
    options: &RepairOptions,
    fileset_id: FilesetId,
    remote_name: &str,
    codec: Codec,
) -> Result<ClosedVolume> {
    let time = db
        .filesets()
        .iter()
        .find(|f| f.id == fileset_id)
        .map(|f| f.time)
        .ok_or_else(|| DarnerError::Other(format!("unknown fileset id {fileset_id}")))?;
    let is_full = db.is_fileset_full_backup(fileset_id);

    let mut writer = FilesetVolumeWriter::new(remote_name, codec, time, is_full);
    for record in db.write_fileset(fileset_id) {
        writer.add_file(record);
    }
    for control_path in &options.control_files {
        let data = std::fs::read(control_path)?;
        let name = control_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| control_path.display().to_string());
        writer.add_control_file(name, data);
    }
    writer.close()
}

/// Re-populate a fileset's rows from a Files volume payload.
/// Returns the number of file entries written.
pub fn reconstruct_fileset(
    db: &mut LocalStateDatabase,
    fileset_id: FilesetId,
    payload: &FilesetPayload,
    filter: &PathFilter,
) -> usize {
    let mut written = 0;
    for file in &payload.files {
        if !filter.matches(&file.path) {
            continue;
        }
        if db.get_metadata(&file.meta_hash).is_none() && !file.metadata.is_empty() {
            db.add_metadata(&file.meta_hash, file.metadata.clone());
        }
        if let Some(blocklist_hash) = &file.blocklist_hash {
            if db.get_blocklist(blocklist_hash).is_none() {
                db.register_blocklist(blocklist_hash, file.block_hashes.clone());
            }
        }
        db.add_file_entry(FileEntryRow {
            fileset_id,
            path: file.path.clone(),
            file_type: file.file_type,
            size: file.size,
            meta_hash: file.meta_hash.clone(),
            block_hashes: file.block_hashes.clone(),
            blocklist_hash: file.blocklist_hash.clone(),
        });
        written += 1;
    }
    written
}

/// Repair filesets whose file entries reference unknown blocks by
/// re-populating each from its remote Files volume. Each fileset commits
/// independently; a failure on one does not poison the rest.
pub fn run_repair_broken_filesets(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
) -> Result<usize> {
    let broken = db.get_filesets_with_missing_files(options.blocksize);
    if broken.is_empty() {
        return Ok(0);
    }
    info!(count = broken.len(), "repairing filesets referencing unknown blocks");

    let mut repaired = 0;
    for fileset_id in broken {
        match repair_one_fileset(backend, db, options, fileset_id) {
            Ok(true) => repaired += 1,
            Ok(false) => {}
            Err(e) if e.is_abort() => return Err(e),
            Err(e) => {
                warn!(fileset_id, error = %e, "FileAccessError: failed to repair broken fileset");
            }
        }
    }
    Ok(repaired)
}

fn repair_one_fileset(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    fileset_id: FilesetId,
) -> Result<bool> {
    let volume = match db.get_remote_volume_from_fileset_id(fileset_id) {
        Some(volume) => volume.clone(),
        None => {
            warn!(fileset_id, "broken fileset has no remote volume; a later pass recreates it");
            return Ok(false);
        }
    };

    let parsed = parse_with_prefix(&volume.name, &options.prefix)
        .ok_or_else(|| DarnerError::InvalidVolumeName(volume.name.clone()))?;
    // The codec id comes from the filename, never from the archive.
    Codec::from_id(&parsed.codec)?;

    if options.dry_run {
        info!(
            name = volume.name.as_str(),
            "would re-populate fileset rows from the remote fileset volume"
        );
        return Ok(false);
    }

    let file = backend.get(
        &volume.name,
        volume.hash.as_deref(),
        (volume.size >= 0).then_some(volume.size),
    )?;
    let payload: FilesetPayload = read_payload(file.path())?;

    db.delete_fileset_entries(fileset_id);
    let written = reconstruct_fileset(db, fileset_id, &payload, &PathFilter::empty());
    db.commit("PostRepairFileset")?;
    info!(
        name = volume.name.as_str(),
        entries = written,
        "re-populated fileset from remote volume"
    );
    Ok(true)
}
