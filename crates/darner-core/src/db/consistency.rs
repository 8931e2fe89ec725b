use std::collections::HashSet;

use tracing::{debug, warn};

use crate::error::{DarnerError, Result};
use crate::hash::{decode_hash, encode_hash, HashAlgorithm};
use crate::volume::payload::FileType;

use super::{block_size_at, BlocklistRow, LocalStateDatabase};

/// Counters from one consistency pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyStats {
    pub duplicate_metadata_removed: usize,
    pub duplicate_file_entries_removed: usize,
    pub duplicate_blocklists_removed: usize,
    pub blocklists_added: usize,
}

impl ConsistencyStats {
    pub fn changed_anything(&self) -> bool {
        *self != ConsistencyStats::default()
    }
}

/// Run every fix, in order. Idempotent: a second pass over an already-fixed
/// database changes nothing. Safe even on partially recreated databases, so
/// guard flags only warn.
pub fn run_all(
    db: &mut LocalStateDatabase,
    algorithm: HashAlgorithm,
    blocksize: usize,
) -> Result<ConsistencyStats> {
    if db.repair_in_progress() {
        warn!("database is marked repair-in-progress; consistency fixes will run anyway");
    }
    if db.partially_recreated() {
        warn!("database is marked partially recreated; consistency fixes will run anyway");
    }

    let mut stats = ConsistencyStats::default();
    stats.duplicate_metadata_removed = fix_duplicate_metahash(db);
    stats.duplicate_file_entries_removed = fix_duplicate_fileentries(db);
    stats.duplicate_blocklists_removed =
        fix_duplicate_blocklist_hashes(db, blocksize, algorithm.digest_len());
    stats.blocklists_added = fix_missing_blocklist_hashes(db, algorithm, blocksize)?;

    if stats.changed_anything() {
        debug!(?stats, "consistency pass repaired database rows");
    }
    Ok(stats)
}

/// Remove duplicate metadata rows, keeping the first per hash.
pub fn fix_duplicate_metahash(db: &mut LocalStateDatabase) -> usize {
    let before = db.state.metadata.len();
    let mut seen = HashSet::new();
    db.state.metadata.retain(|row| seen.insert(row.hash.clone()));
    before - db.state.metadata.len()
}

/// Remove duplicate file entries, keeping the first per (fileset, path).
pub fn fix_duplicate_fileentries(db: &mut LocalStateDatabase) -> usize {
    let before = db.state.file_entries.len();
    let mut seen = HashSet::new();
    db.state
        .file_entries
        .retain(|row| seen.insert((row.fileset_id, row.path.clone())));
    before - db.state.file_entries.len()
}

/// Remove duplicate blocklist rows, keeping the first per hash. Rows wider
/// than one blocklist block can hold are a recreate artifact and are warned
/// about but kept (dropping them would lose the only copy of the sequence).
pub fn fix_duplicate_blocklist_hashes(
    db: &mut LocalStateDatabase,
    blocksize: usize,
    hash_size: usize,
) -> usize {
    let capacity = (blocksize / hash_size).max(1);
    let before = db.state.blocklists.len();
    let mut seen = HashSet::new();
    db.state.blocklists.retain(|row| {
        if row.block_hashes.len() > capacity {
            warn!(
                hash = row.hash.as_str(),
                entries = row.block_hashes.len(),
                capacity,
                "blocklist exceeds one block's capacity"
            );
        }
        seen.insert(row.hash.clone())
    });
    before - db.state.blocklists.len()
}

/// Recreate blocklist rows (and per-entry blocklist hashes) for multi-block
/// file entries that lost them.
pub fn fix_missing_blocklist_hashes(
    db: &mut LocalStateDatabase,
    algorithm: HashAlgorithm,
    _blocksize: usize,
) -> Result<usize> {
    let mut added = 0;

    // Collect the missing rows first; registering while iterating entries
    // would alias the borrow.
    let mut pending: Vec<BlocklistRow> = Vec::new();
    let mut entry_hashes: Vec<(usize, String)> = Vec::new();

    for (pos, entry) in db.state.file_entries.iter().enumerate() {
        if entry.block_hashes.len() <= 1 {
            continue;
        }
        let mut concatenated = Vec::with_capacity(entry.block_hashes.len() * algorithm.digest_len());
        for hash in &entry.block_hashes {
            concatenated.extend_from_slice(&decode_hash(hash)?);
        }
        let computed = encode_hash(&algorithm.digest(&concatenated));

        match &entry.blocklist_hash {
            Some(recorded) if *recorded != computed => {
                return Err(DarnerError::DatabaseInconsistent(format!(
                    "file entry '{}' records blocklist hash {recorded} but its blocks hash to {computed}",
                    entry.path
                )));
            }
            Some(_) => {}
            None => entry_hashes.push((pos, computed.clone())),
        }

        if db.get_blocklist(&computed).is_none()
            && !pending.iter().any(|p| p.hash == computed)
        {
            pending.push(BlocklistRow {
                hash: computed,
                block_hashes: entry.block_hashes.clone(),
            });
        }
    }

    for (pos, hash) in entry_hashes {
        db.state.file_entries[pos].blocklist_hash = Some(hash);
    }
    for row in pending {
        debug!(hash = row.hash.as_str(), "recreated missing blocklist");
        db.state.blocklists.push(row);
        added += 1;
    }
    Ok(added)
}

/// Database-wide sanity check gating destructive remote repair. Missing
/// blocks are not an inconsistency here (later phases recover them); broken
/// internal shape is.
pub fn verify_consistency_for_repair(
    db: &LocalStateDatabase,
    blocksize: usize,
) -> Result<()> {
    for entry in &db.state.file_entries {
        if entry.file_type != FileType::File {
            continue;
        }
        let expected = if entry.size == 0 {
            0
        } else {
            ((entry.size as usize) + blocksize - 1) / blocksize
        };
        if entry.block_hashes.len() != expected {
            return Err(DarnerError::DatabaseInconsistent(format!(
                "file entry '{}' has {} block(s) but its size {} requires {}",
                entry.path,
                entry.block_hashes.len(),
                entry.size,
                expected
            )));
        }
        if let Some(last) = entry.block_hashes.len().checked_sub(1) {
            let width = block_size_at(entry.size, last, blocksize);
            if width <= 0 {
                return Err(DarnerError::DatabaseInconsistent(format!(
                    "file entry '{}' has an empty trailing block",
                    entry.path
                )));
            }
        }
    }

    for fileset in &db.state.filesets {
        if let Some(volume_id) = fileset.volume_id {
            if !db.state.remote_volumes.iter().any(|v| v.id == volume_id) {
                return Err(DarnerError::DatabaseInconsistent(format!(
                    "fileset at {} links to a volume row that does not exist",
                    fileset.time
                )));
            }
        }
    }

    for blocklist in &db.state.blocklists {
        if blocklist.block_hashes.is_empty() {
            return Err(DarnerError::DatabaseInconsistent(format!(
                "blocklist {} is empty",
                blocklist.hash
            )));
        }
    }

    Ok(())
}
