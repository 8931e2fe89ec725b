use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::compress::Codec;
use crate::config::{PathFilter, RepairOptions};
use crate::db::{FileEntryRow, LocalStateDatabase};
use crate::error::Result;
use crate::hash::HashAlgorithm;
use crate::repair::{self, RepairRequest, RepairStats};
use crate::testutil::MemoryBackend;
use crate::volume::name::VolumeName;
use crate::volume::payload::FileType;
use crate::volume::writer::{BlockVolumeWriter, FilesetVolumeWriter, IndexVolumeWriter};
use crate::volume::{VolumeKind, VolumeState};

/// Block width used by every fixture; the single source file is exactly one
/// block wide so offsets stay trivial.
pub const TEST_BLOCKSIZE: usize = 1024;

/// A seeded repository: one fileset, one source file, one block, one Blocks
/// volume, one index volume covering it, all Verified and all present
/// remotely. Tests then break it in controlled ways.
pub struct Seeded {
    pub dir: TempDir,
    pub backend: MemoryBackend,
    pub options: RepairOptions,
    pub time: DateTime<Utc>,
    pub source_path: PathBuf,
    pub block_hash: String,
    pub block_data: Vec<u8>,
    pub data_name: String,
    pub data_hash: String,
    pub data_size: i64,
    pub index_name: String,
    pub fileset_name: String,
}

pub fn seed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

pub fn seed_repository() -> Seeded {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let time = seed_time();

    let mut options = RepairOptions::new(dir.path().join("state.db"));
    options.blocksize = TEST_BLOCKSIZE;

    let block_data: Vec<u8> = (0..TEST_BLOCKSIZE).map(|i| (i % 251) as u8).collect();
    let algorithm = HashAlgorithm::Sha256;
    let block_hash = algorithm.hash_base64(&block_data);

    let source_path = dir.path().join("source.txt");
    std::fs::write(&source_path, &block_data).unwrap();

    let mut db = LocalStateDatabase::create(&options.dbpath).unwrap();

    // Blocks volume holding the single block.
    let data_name = VolumeName::generate(&options.prefix, VolumeKind::Blocks, time, "zstd").format();
    let mut writer = BlockVolumeWriter::new(data_name.clone(), Codec::Zstd);
    writer.append_block(block_hash.clone(), block_data.clone());
    let closed = writer.close().unwrap();
    let (data_hash, data_size) = algorithm.hash_file(closed.path()).unwrap();
    backend.insert(&data_name, std::fs::read(closed.path()).unwrap());
    let data_id = db.register_remote_volume(&data_name, VolumeKind::Blocks, VolumeState::Verified, time);
    db.update_remote_volume(&data_name, VolumeState::Verified, data_size, Some(&data_hash))
        .unwrap();
    db.register_block(&block_hash, TEST_BLOCKSIZE as i64, data_id);

    // Index volume covering the Blocks volume.
    let index_name = VolumeName::generate(&options.prefix, VolumeKind::Index, time, "zstd").format();
    let mut writer = IndexVolumeWriter::new(index_name.clone(), Codec::Zstd);
    writer.start_volume(data_name.clone(), data_hash.clone(), data_size);
    writer.add_block(block_hash.clone(), TEST_BLOCKSIZE as i64).unwrap();
    let closed = writer.close().unwrap();
    let (index_hash, index_size) = algorithm.hash_file(closed.path()).unwrap();
    backend.insert(&index_name, std::fs::read(closed.path()).unwrap());
    let index_id = db.register_remote_volume(&index_name, VolumeKind::Index, VolumeState::Verified, time);
    db.update_remote_volume(&index_name, VolumeState::Verified, index_size, Some(&index_hash))
        .unwrap();
    db.add_index_block_link(index_id, data_id);

    // Files volume describing the snapshot.
    let fileset_name = VolumeName::generate(&options.prefix, VolumeKind::Files, time, "zstd").format();
    let metadata = b"mode=0644".to_vec();
    let meta_hash = algorithm.hash_base64(&metadata);
    let mut writer = FilesetVolumeWriter::new(fileset_name.clone(), Codec::Zstd, time, true);
    writer.add_file(crate::volume::payload::FileRecord {
        path: source_path.display().to_string(),
        file_type: FileType::File,
        size: TEST_BLOCKSIZE as i64,
        meta_hash: meta_hash.clone(),
        metadata: metadata.clone(),
        block_hashes: vec![block_hash.clone()],
        blocklist_hash: None,
    });
    let closed = writer.close().unwrap();
    let (fileset_hash, fileset_size) = algorithm.hash_file(closed.path()).unwrap();
    backend.insert(&fileset_name, std::fs::read(closed.path()).unwrap());
    let fileset_volume_id =
        db.register_remote_volume(&fileset_name, VolumeKind::Files, VolumeState::Verified, time);
    db.update_remote_volume(&fileset_name, VolumeState::Verified, fileset_size, Some(&fileset_hash))
        .unwrap();

    let fileset_id = db.create_fileset(Some(fileset_volume_id), time, true);
    db.add_metadata(&meta_hash, metadata);
    db.add_file_entry(FileEntryRow {
        fileset_id,
        path: source_path.display().to_string(),
        file_type: FileType::File,
        size: TEST_BLOCKSIZE as i64,
        meta_hash,
        block_hashes: vec![block_hash.clone()],
        blocklist_hash: None,
    });
    db.commit("SeedFixture").unwrap();

    Seeded {
        dir,
        backend,
        options,
        time,
        source_path,
        block_hash,
        block_data,
        data_name,
        data_hash,
        data_size,
        index_name,
        fileset_name,
    }
}

pub fn run_repair(seed: &Seeded) -> Result<RepairStats> {
    repair::run(
        &seed.backend,
        RepairRequest {
            options: &seed.options,
            filter: &PathFilter::empty(),
            recreate: None,
            progress: None,
            cancel: None,
        },
    )
}

pub fn open_db(seed: &Seeded) -> LocalStateDatabase {
    LocalStateDatabase::open(&seed.options.dbpath).unwrap()
}

/// Bytes of an index volume that claims the seeded Blocks volume, under a
/// fresh remote name (used for adoption tests).
pub fn build_adoptable_index(seed: &Seeded) -> (String, Vec<u8>) {
    let name =
        VolumeName::generate(&seed.options.prefix, VolumeKind::Index, seed.time, "zstd").format();
    let mut writer = IndexVolumeWriter::new(name.clone(), Codec::Zstd);
    writer.start_volume(seed.data_name.clone(), seed.data_hash.clone(), seed.data_size);
    writer
        .add_block(seed.block_hash.clone(), TEST_BLOCKSIZE as i64)
        .unwrap();
    let closed = writer.close().unwrap();
    let bytes = std::fs::read(closed.path()).unwrap();
    (name, bytes)
}

/// Bytes of a Files volume at the given time with no file entries.
pub fn build_empty_fileset_volume(seed: &Seeded, time: DateTime<Utc>) -> (String, Vec<u8>) {
    let name =
        VolumeName::generate(&seed.options.prefix, VolumeKind::Files, time, "zstd").format();
    let writer = FilesetVolumeWriter::new(name.clone(), Codec::Zstd, time, false);
    let closed = writer.close().unwrap();
    let bytes = std::fs::read(closed.path()).unwrap();
    (name, bytes)
}
