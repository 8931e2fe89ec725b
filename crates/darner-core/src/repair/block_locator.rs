use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use tracing::{debug, info, warn};

use crate::compress::Codec;
use crate::config::RepairOptions;
use crate::db::{LocalStateDatabase, RemoteVolumeRow, VolumeId};
use crate::error::{DarnerError, Result};
use crate::hash::HashAlgorithm;
use crate::storage::{Backend, FetchRequest};
use crate::volume::payload::{read_payload, BlocksPayload};
use crate::volume::writer::{BlockVolumeWriter, ClosedVolume};

/// Outcome of attempting to rebuild a missing Blocks volume.
pub enum RebuildOutcome {
    /// Every block recovered; the volume is ready to upload under its
    /// original remote name.
    Complete(ClosedVolume),
    /// Dry-run: report what a real run would have done.
    DryRun { recoverable: usize, missing: usize },
}

/// Rebuild a missing Blocks volume from whatever sources remain: local files
/// that still contain the block bytes, then surviving copies in other remote
/// volumes. A volume missing any block is never uploaded.
pub fn rebuild_blocks_volume(
    backend: &dyn Backend,
    db: &LocalStateDatabase,
    options: &RepairOptions,
    volume: &RemoteVolumeRow,
    codec: Codec,
) -> Result<RebuildOutcome> {
    let algorithm = HashAlgorithm::from_config(&options.block_hash_algorithm)?;
    let target_blocks = db.get_blocks(volume.id);
    let mut missing: HashSet<(String, i64)> = target_blocks.iter().cloned().collect();
    let mut writer = BlockVolumeWriter::new(volume.name.clone(), codec);

    debug!(
        name = volume.name.as_str(),
        blocks = target_blocks.len(),
        "rebuilding missing Blocks volume"
    );

    restore_from_local_files(db, options, algorithm, &mut missing, &mut writer);

    if !missing.is_empty() {
        restore_from_donor_volumes(backend, db, algorithm, volume.id, &mut missing, &mut writer)?;
    }

    if !missing.is_empty() {
        let hashes: HashSet<String> = missing.iter().map(|(h, _)| h.clone()).collect();
        let filesets = db.get_filesets_using_blocks(&hashes);
        if options.dry_run {
            info!(
                name = volume.name.as_str(),
                missing = missing.len(),
                affected_filesets = ?filesets,
                "would fail: blocks unrecoverable from any source"
            );
            return Ok(RebuildOutcome::DryRun {
                recoverable: writer.block_count(),
                missing: missing.len(),
            });
        }
        return Err(DarnerError::RepairIsNotPossible {
            missing: missing.len(),
            filesets,
        });
    }

    if options.dry_run {
        info!(
            name = volume.name.as_str(),
            blocks = writer.block_count(),
            "would rebuild and upload Blocks volume"
        );
        return Ok(RebuildOutcome::DryRun {
            recoverable: writer.block_count(),
            missing: 0,
        });
    }

    Ok(RebuildOutcome::Complete(writer.close()?))
}

/// First pass: re-read blocks from the local files they were last seen in.
/// File access errors are expected (files move and change) and only logged.
fn restore_from_local_files(
    db: &LocalStateDatabase,
    options: &RepairOptions,
    algorithm: HashAlgorithm,
    missing: &mut HashSet<(String, i64)>,
    writer: &mut BlockVolumeWriter,
) {
    let wanted: HashSet<String> = missing.iter().map(|(h, _)| h.clone()).collect();
    for hint in db.get_source_files_with_blocks(&wanted, options.blocksize) {
        let key = (hint.hash.clone(), hint.size);
        if !missing.contains(&key) {
            continue;
        }
        match read_block_at(&hint.path, hint.offset, hint.size) {
            Ok(data) => {
                if algorithm.hash_base64(&data) == hint.hash {
                    writer.append_block(hint.hash.clone(), data);
                    missing.remove(&key);
                } else {
                    debug!(
                        path = hint.path.as_str(),
                        offset = hint.offset,
                        "local file content changed since last backup"
                    );
                }
            }
            Err(e) => {
                debug!(
                    path = hint.path.as_str(),
                    error = %e,
                    "FileAccessError: skipping local block source"
                );
            }
        }
    }
}

fn read_block_at(path: &str, offset: u64, size: i64) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; size.max(0) as usize];
    file.read_exact(&mut data)?;
    Ok(data)
}

/// Second pass: pull surviving copies out of other remote volumes, fetching
/// each donor volume once and streaming its blocks.
fn restore_from_donor_volumes(
    backend: &dyn Backend,
    db: &LocalStateDatabase,
    algorithm: HashAlgorithm,
    target_volume: VolumeId,
    missing: &mut HashSet<(String, i64)>,
    writer: &mut BlockVolumeWriter,
) -> Result<()> {
    // Group still-missing blocks by the donor volumes that hold a copy.
    let mut donors: HashMap<VolumeId, HashSet<(String, i64)>> = HashMap::new();
    for (hash, size) in missing.iter() {
        if let Some(block) = db.get_block(hash, *size) {
            for &donor in block
                .duplicate_volume_ids
                .iter()
                .chain(std::iter::once(&block.volume_id))
            {
                if donor != target_volume {
                    donors
                        .entry(donor)
                        .or_default()
                        .insert((hash.clone(), *size));
                }
            }
        }
    }
    if donors.is_empty() {
        return Ok(());
    }

    let mut requests = Vec::new();
    let mut wanted_by_name: HashMap<String, HashSet<(String, i64)>> = HashMap::new();
    for (donor_id, blocks) in donors {
        let Some(row) = db.remote_volumes().iter().find(|v| v.id == donor_id) else {
            continue;
        };
        if !row.state.is_durable() {
            continue;
        }
        requests.push(FetchRequest {
            name: row.name.clone(),
            hash: row.hash.clone(),
            size: (row.size >= 0).then_some(row.size),
        });
        wanted_by_name.insert(row.name.clone(), blocks);
    }

    for fetched in backend.get_files_overlapped(requests) {
        let fetched = match fetched {
            Ok(f) => f,
            Err(e) if e.is_abort() => return Err(e),
            Err(e) => {
                warn!(error = %e, "RemoteFileAccessError: skipping donor volume");
                continue;
            }
        };
        let Some(wanted) = wanted_by_name.get(&fetched.name) else {
            continue;
        };
        let payload: BlocksPayload = match read_payload(fetched.file.path()) {
            Ok(p) => p,
            Err(e) => {
                warn!(name = fetched.name.as_str(), error = %e, "RemoteFileAccessError: unreadable donor volume");
                continue;
            }
        };
        for block in payload.blocks {
            let key = (block.hash.clone(), block.data.len() as i64);
            if !missing.contains(&key) || !wanted.contains(&key) {
                continue;
            }
            if algorithm.hash_base64(&block.data) != block.hash {
                warn!(
                    name = fetched.name.as_str(),
                    hash = block.hash.as_str(),
                    "donor volume block fails its own hash"
                );
                continue;
            }
            writer.append_block(block.hash, block.data);
            missing.remove(&key);
        }
        if missing.is_empty() {
            break;
        }
    }
    Ok(())
}
