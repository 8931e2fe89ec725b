pub mod consistency;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DarnerError, Result};
use crate::volume::payload::{FileRecord, FileType};
use crate::volume::{VolumeKind, VolumeState};

pub type VolumeId = i64;
pub type FilesetId = i64;

/// One remote volume as tracked locally. `name` is the identity;
/// `(kind, time)` is not unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteVolumeRow {
    pub id: VolumeId,
    pub name: String,
    pub kind: VolumeKind,
    pub state: VolumeState,
    /// -1 while unknown (e.g. registered but not yet measured).
    pub size: i64,
    /// Base64 whole-file hash, when known.
    pub hash: Option<String>,
    pub time: DateTime<Utc>,
}

/// One snapshot, linked 1:1 to a Files volume when healthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesetRow {
    pub id: FilesetId,
    pub volume_id: Option<VolumeId>,
    pub time: DateTime<Utc>,
    pub is_full_backup: bool,
}

/// One file entry inside a fileset. Mirrors the Files-volume record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntryRow {
    pub fileset_id: FilesetId,
    pub path: String,
    pub file_type: FileType,
    pub size: i64,
    pub meta_hash: String,
    pub block_hashes: Vec<String>,
    pub blocklist_hash: Option<String>,
}

/// A content-addressed block: identity is `(hash, size)`. The block lives in
/// exactly one home volume at rest, but deduplicated copies may survive in
/// other volumes, which matters when the home volume goes missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRow {
    pub hash: String,
    pub size: i64,
    pub volume_id: VolumeId,
    #[serde(default)]
    pub duplicate_volume_ids: Vec<VolumeId>,
}

/// An ordered block-hash sequence, itself stored as a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistRow {
    pub hash: String,
    pub block_hashes: Vec<String>,
}

/// Serialized filesystem metadata, deduplicated by hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRow {
    pub hash: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DatabaseState {
    next_id: i64,
    remote_volumes: Vec<RemoteVolumeRow>,
    filesets: Vec<FilesetRow>,
    file_entries: Vec<FileEntryRow>,
    blocks: Vec<BlockRow>,
    blocklists: Vec<BlocklistRow>,
    metadata: Vec<MetadataRow>,
    /// (index volume id, Blocks volume id)
    index_links: Vec<(VolumeId, VolumeId)>,
    partially_recreated: bool,
    repair_in_progress: bool,
    terminated_with_active_uploads: bool,
    last_end_time: Option<DateTime<Utc>>,
}

/// The local state database: an in-memory relation set persisted as a single
/// msgpack file. Mutations accumulate in memory; `commit` persists the whole
/// file atomically and an error path abandons uncommitted state via `reload`.
#[derive(Debug)]
pub struct LocalStateDatabase {
    path: PathBuf,
    state: DatabaseState,
}

impl LocalStateDatabase {
    /// Create a fresh, empty database file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let db = Self {
            path: path.into(),
            state: DatabaseState::default(),
        };
        db.persist()?;
        Ok(db)
    }

    /// Open an existing database file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = fs::read(&path).map_err(|_| {
            DarnerError::RepairDatabaseFileDoesNotExist(path.display().to_string())
        })?;
        let state: DatabaseState = rmp_serde::from_slice(&bytes)?;
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the current state, logging the phase's commit tag.
    pub fn commit(&mut self, tag: &str) -> Result<()> {
        self.persist()?;
        debug!(tag, "committed database transaction");
        Ok(())
    }

    /// Discard uncommitted in-memory state by re-reading the file.
    pub fn reload(&mut self) -> Result<()> {
        let bytes = fs::read(&self.path)?;
        self.state = rmp_serde::from_slice(&bytes)?;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let bytes = rmp_serde::to_vec(&self.state)?;
        let staging = self.path.with_extension("db-tmp");
        fs::write(&staging, &bytes)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    fn alloc_id(&mut self) -> i64 {
        self.state.next_id += 1;
        self.state.next_id
    }

    // ----- Guard flags and settings -----

    pub fn partially_recreated(&self) -> bool {
        self.state.partially_recreated
    }

    pub fn set_partially_recreated(&mut self, value: bool) {
        self.state.partially_recreated = value;
    }

    pub fn repair_in_progress(&self) -> bool {
        self.state.repair_in_progress
    }

    pub fn set_repair_in_progress(&mut self, value: bool) {
        self.state.repair_in_progress = value;
    }

    pub fn terminated_with_active_uploads(&self) -> bool {
        self.state.terminated_with_active_uploads
    }

    pub fn set_terminated_with_active_uploads(&mut self, value: bool) {
        self.state.terminated_with_active_uploads = value;
    }

    pub fn write_end_time(&mut self, time: DateTime<Utc>) {
        self.state.last_end_time = Some(time);
    }

    pub fn last_end_time(&self) -> Option<DateTime<Utc>> {
        self.state.last_end_time
    }

    // ----- Remote volumes -----

    pub fn remote_volumes(&self) -> &[RemoteVolumeRow] {
        &self.state.remote_volumes
    }

    pub fn remote_volume_count(&self) -> usize {
        self.state.remote_volumes.len()
    }

    pub fn get_remote_volume(&self, name: &str) -> Option<&RemoteVolumeRow> {
        self.state.remote_volumes.iter().find(|v| v.name == name)
    }

    pub fn get_remote_volume_id(&self, name: &str) -> Option<VolumeId> {
        self.get_remote_volume(name).map(|v| v.id)
    }

    pub fn register_remote_volume(
        &mut self,
        name: &str,
        kind: VolumeKind,
        state: VolumeState,
        time: DateTime<Utc>,
    ) -> VolumeId {
        let id = self.alloc_id();
        self.state.remote_volumes.push(RemoteVolumeRow {
            id,
            name: name.to_string(),
            kind,
            state,
            size: -1,
            hash: None,
            time,
        });
        id
    }

    /// Update a volume's lifecycle state and, when known, its measured identity.
    pub fn update_remote_volume(
        &mut self,
        name: &str,
        state: VolumeState,
        size: i64,
        hash: Option<&str>,
    ) -> Result<()> {
        let row = self
            .state
            .remote_volumes
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or_else(|| DarnerError::Other(format!("unknown remote volume: '{name}'")))?;
        row.state = state;
        if size >= 0 {
            row.size = size;
        }
        if let Some(hash) = hash {
            row.hash = Some(hash.to_string());
        }
        Ok(())
    }

    /// Drop a volume row entirely (used for Temporary leftovers). Filesets
    /// that pointed at it are left unlinked, which is what flags them for a
    /// reupload.
    pub fn remove_remote_volume(&mut self, name: &str) {
        if let Some(pos) = self
            .state
            .remote_volumes
            .iter()
            .position(|v| v.name == name)
        {
            let id = self.state.remote_volumes[pos].id;
            self.state.remote_volumes.remove(pos);
            self.state.index_links.retain(|&(i, b)| i != id && b != id);
            for fileset in self
                .state
                .filesets
                .iter_mut()
                .filter(|f| f.volume_id == Some(id))
            {
                fileset.volume_id = None;
            }
        }
    }

    // ----- Filesets -----

    pub fn filesets(&self) -> &[FilesetRow] {
        &self.state.filesets
    }

    pub fn create_fileset(
        &mut self,
        volume_id: Option<VolumeId>,
        time: DateTime<Utc>,
        is_full_backup: bool,
    ) -> FilesetId {
        let id = self.alloc_id();
        self.state.filesets.push(FilesetRow {
            id,
            volume_id,
            time,
            is_full_backup,
        });
        id
    }

    pub fn link_fileset_to_volume(&mut self, fileset_id: FilesetId, volume_id: VolumeId) {
        if let Some(fileset) = self
            .state
            .filesets
            .iter_mut()
            .find(|f| f.id == fileset_id)
        {
            fileset.volume_id = Some(volume_id);
        }
    }

    pub fn get_fileset_id_from_remotename(&self, name: &str) -> Option<FilesetId> {
        let volume_id = self.get_remote_volume_id(name)?;
        self.state
            .filesets
            .iter()
            .find(|f| f.volume_id == Some(volume_id))
            .map(|f| f.id)
    }

    pub fn fileset_times(&self) -> Vec<(FilesetId, DateTime<Utc>)> {
        self.state.filesets.iter().map(|f| (f.id, f.time)).collect()
    }

    pub fn is_fileset_full_backup(&self, fileset_id: FilesetId) -> bool {
        self.state
            .filesets
            .iter()
            .find(|f| f.id == fileset_id)
            .map(|f| f.is_full_backup)
            .unwrap_or(false)
    }

    pub fn get_remote_volume_from_fileset_id(
        &self,
        fileset_id: FilesetId,
    ) -> Option<&RemoteVolumeRow> {
        let fileset = self.state.filesets.iter().find(|f| f.id == fileset_id)?;
        let volume_id = fileset.volume_id?;
        self.state.remote_volumes.iter().find(|v| v.id == volume_id)
    }

    /// Filesets whose linked Files volume is gone or non-durable.
    pub fn missing_remote_filesets(&self) -> Vec<FilesetRow> {
        self.state
            .filesets
            .iter()
            .filter(|f| {
                match f.volume_id {
                    None => true,
                    Some(volume_id) => self
                        .state
                        .remote_volumes
                        .iter()
                        .find(|v| v.id == volume_id)
                        .map(|v| {
                            !v.state.is_durable() && v.state != VolumeState::Uploading
                        })
                        .unwrap_or(true),
                }
            })
            .cloned()
            .collect()
    }

    /// Files-volume rows with no fileset pointing at them.
    pub fn missing_local_filesets(&self) -> Vec<RemoteVolumeRow> {
        let linked: HashSet<VolumeId> = self
            .state
            .filesets
            .iter()
            .filter_map(|f| f.volume_id)
            .collect();
        self.state
            .remote_volumes
            .iter()
            .filter(|v| {
                v.kind == VolumeKind::Files
                    && matches!(
                        v.state,
                        VolumeState::Uploading | VolumeState::Uploaded | VolumeState::Verified
                    )
                    && !linked.contains(&v.id)
            })
            .cloned()
            .collect()
    }

    /// Durable index volumes that cover no Blocks volume at all.
    pub fn empty_index_files(&self) -> Vec<RemoteVolumeRow> {
        self.state
            .remote_volumes
            .iter()
            .filter(|v| {
                v.kind == VolumeKind::Index
                    && v.state.is_durable()
                    && !self.state.index_links.iter().any(|&(i, _)| i == v.id)
            })
            .cloned()
            .collect()
    }

    /// The newest fileset whose volume never reached a durable state; its
    /// remote name is exempted from cleanup so a later run can synthesize a
    /// filelist there.
    pub fn get_last_incomplete_fileset_volume(&self) -> Option<String> {
        self.state
            .filesets
            .iter()
            .filter_map(|f| {
                let volume_id = f.volume_id?;
                let volume = self
                    .state
                    .remote_volumes
                    .iter()
                    .find(|v| v.id == volume_id)?;
                (!volume.state.is_durable()).then(|| (f.time, volume.name.clone()))
            })
            .max_by_key(|(time, _)| *time)
            .map(|(_, name)| name)
    }

    // ----- Blocks and blocklists -----

    pub fn register_block(&mut self, hash: &str, size: i64, volume_id: VolumeId) {
        if let Some(row) = self
            .state
            .blocks
            .iter_mut()
            .find(|b| b.hash == hash && b.size == size)
        {
            if row.volume_id != volume_id && !row.duplicate_volume_ids.contains(&volume_id) {
                row.duplicate_volume_ids.push(volume_id);
            }
            return;
        }
        self.state.blocks.push(BlockRow {
            hash: hash.to_string(),
            size,
            volume_id,
            duplicate_volume_ids: Vec::new(),
        });
    }

    pub fn block_known(&self, hash: &str, size: i64) -> bool {
        self.state
            .blocks
            .iter()
            .any(|b| b.hash == hash && b.size == size)
    }

    pub fn get_block(&self, hash: &str, size: i64) -> Option<&BlockRow> {
        self.state
            .blocks
            .iter()
            .find(|b| b.hash == hash && b.size == size)
    }

    /// Every `(hash, size)` homed in the given volume.
    pub fn get_blocks(&self, volume_id: VolumeId) -> Vec<(String, i64)> {
        self.state
            .blocks
            .iter()
            .filter(|b| b.volume_id == volume_id)
            .map(|b| (b.hash.clone(), b.size))
            .collect()
    }

    /// Check that every claimed `(hash, size)` is recorded for this volume,
    /// either as home or as a surviving duplicate.
    pub fn check_all_blocks_are_in_volume(
        &self,
        volume_id: VolumeId,
        blocks: &[(String, i64)],
    ) -> bool {
        blocks.iter().all(|(hash, size)| {
            self.state.blocks.iter().any(|b| {
                b.hash == *hash
                    && b.size == *size
                    && (b.volume_id == volume_id || b.duplicate_volume_ids.contains(&volume_id))
            })
        })
    }

    pub fn register_blocklist(&mut self, hash: &str, block_hashes: Vec<String>) {
        if self.state.blocklists.iter().any(|b| b.hash == hash) {
            return;
        }
        self.state.blocklists.push(BlocklistRow {
            hash: hash.to_string(),
            block_hashes,
        });
    }

    pub fn get_blocklist(&self, hash: &str) -> Option<&BlocklistRow> {
        self.state.blocklists.iter().find(|b| b.hash == hash)
    }

    /// Blocklists stored as blocks inside the given volume, as raw
    /// concatenated digests ready for an index volume's blocklist section.
    pub fn get_blocklists(&self, volume_id: VolumeId) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for block in self
            .state
            .blocks
            .iter()
            .filter(|b| b.volume_id == volume_id)
        {
            if let Some(blocklist) = self.get_blocklist(&block.hash) {
                let mut data = Vec::with_capacity(blocklist.block_hashes.len() * 32);
                for hash in &blocklist.block_hashes {
                    data.extend_from_slice(&crate::hash::decode_hash(hash)?);
                }
                out.push((blocklist.hash.clone(), data));
            }
        }
        Ok(out)
    }

    // ----- Index links -----

    pub fn add_index_block_link(&mut self, index_id: VolumeId, blocks_id: VolumeId) {
        if !self.state.index_links.contains(&(index_id, blocks_id)) {
            self.state.index_links.push((index_id, blocks_id));
        }
    }

    /// The Blocks volumes an index volume of this name should cover.
    pub fn get_block_volumes_from_index_name(&self, name: &str) -> Vec<RemoteVolumeRow> {
        let Some(index_id) = self.get_remote_volume_id(name) else {
            return Vec::new();
        };
        self.state
            .index_links
            .iter()
            .filter(|&&(i, _)| i == index_id)
            .filter_map(|&(_, blocks_id)| {
                self.state
                    .remote_volumes
                    .iter()
                    .find(|v| v.id == blocks_id)
                    .cloned()
            })
            .collect()
    }

    // ----- File entries -----

    pub fn file_entries(&self, fileset_id: FilesetId) -> Vec<&FileEntryRow> {
        self.state
            .file_entries
            .iter()
            .filter(|e| e.fileset_id == fileset_id)
            .collect()
    }

    pub fn delete_fileset_entries(&mut self, fileset_id: FilesetId) {
        self.state
            .file_entries
            .retain(|e| e.fileset_id != fileset_id);
    }

    pub fn add_file_entry(&mut self, entry: FileEntryRow) {
        self.state.file_entries.push(entry);
    }

    pub fn add_metadata(&mut self, hash: &str, data: Vec<u8>) {
        self.state.metadata.push(MetadataRow {
            hash: hash.to_string(),
            data,
        });
    }

    pub fn get_metadata(&self, hash: &str) -> Option<&[u8]> {
        self.state
            .metadata
            .iter()
            .find(|m| m.hash == hash)
            .map(|m| m.data.as_slice())
    }

    /// Serialize a fileset's rows as the records a Files volume carries.
    pub fn write_fileset(&self, fileset_id: FilesetId) -> Vec<FileRecord> {
        self.file_entries(fileset_id)
            .into_iter()
            .map(|entry| FileRecord {
                path: entry.path.clone(),
                file_type: entry.file_type,
                size: entry.size,
                meta_hash: entry.meta_hash.clone(),
                metadata: self
                    .get_metadata(&entry.meta_hash)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default(),
                block_hashes: entry.block_hashes.clone(),
                blocklist_hash: entry.blocklist_hash.clone(),
            })
            .collect()
    }

    // ----- Broken fileset queries -----

    /// Filesets with at least one file entry referencing an unknown block.
    pub fn get_filesets_with_missing_files(&self, blocksize: usize) -> Vec<FilesetId> {
        let mut out: Vec<FilesetId> = self
            .state
            .file_entries
            .iter()
            .filter(|entry| {
                entry
                    .block_hashes
                    .iter()
                    .enumerate()
                    .any(|(index, hash)| {
                        let size = block_size_at(entry.size, index, blocksize);
                        !self.block_known(hash, size)
                    })
            })
            .map(|entry| entry.fileset_id)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Times of the filesets that reference any of the given blocks.
    pub fn get_filesets_using_blocks(&self, hashes: &HashSet<String>) -> Vec<DateTime<Utc>> {
        let mut ids: Vec<FilesetId> = self
            .state
            .file_entries
            .iter()
            .filter(|entry| entry.block_hashes.iter().any(|h| hashes.contains(h)))
            .map(|entry| entry.fileset_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        let mut times: Vec<DateTime<Utc>> = self
            .state
            .filesets
            .iter()
            .filter(|f| ids.contains(&f.id))
            .map(|f| f.time)
            .collect();
        times.sort_unstable();
        times
    }

    /// Local `(path, offset)` candidates where each of the given blocks was
    /// last seen during a backup.
    pub fn get_source_files_with_blocks(
        &self,
        hashes: &HashSet<String>,
        blocksize: usize,
    ) -> Vec<BlockSourceHint> {
        let mut hints = Vec::new();
        for entry in &self.state.file_entries {
            if entry.file_type != FileType::File {
                continue;
            }
            for (index, hash) in entry.block_hashes.iter().enumerate() {
                if hashes.contains(hash) {
                    hints.push(BlockSourceHint {
                        hash: hash.clone(),
                        size: block_size_at(entry.size, index, blocksize),
                        path: entry.path.clone(),
                        offset: (index * blocksize) as u64,
                    });
                }
            }
        }
        hints
    }
}

/// A local-file location where a block may still be readable.
#[derive(Debug, Clone)]
pub struct BlockSourceHint {
    pub hash: String,
    pub size: i64,
    pub path: String,
    pub offset: u64,
}

/// Size of the block at `index` in a file laid out as full-width blocks with
/// a trailing remainder.
pub fn block_size_at(file_size: i64, index: usize, blocksize: usize) -> i64 {
    let blocksize = blocksize as i64;
    let start = index as i64 * blocksize;
    (file_size - start).clamp(0, blocksize)
}
