use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Duration;

use crate::config::PathFilter;
use crate::db::FileEntryRow;
use crate::error::DarnerError;
use crate::repair::{self, RepairRequest};
use crate::volume::name::VolumeName;
use crate::volume::payload::{read_payload, BlocksPayload, FileType, IndexPayload};
use crate::volume::writer::{BlockVolumeWriter, IndexVolumeWriter};
use crate::volume::{VolumeKind, VolumeState};
use crate::compress::Codec;
use crate::hash::HashAlgorithm;

use super::helpers::{
    build_adoptable_index, build_empty_fileset_volume, open_db, run_repair, seed_repository,
    TEST_BLOCKSIZE,
};

fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(file.as_file_mut(), bytes).unwrap();
    file
}

#[test]
fn healthy_repository_is_synchronized() {
    let seed = seed_repository();
    let stats = run_repair(&seed).unwrap();
    let remote = stats.remote.unwrap();
    assert!(remote.synchronized);
    assert!(seed.backend.operations().is_empty());
}

#[test]
fn second_repair_after_a_fix_does_nothing() {
    let seed = seed_repository();
    seed.backend.remove(&seed.index_name);

    run_repair(&seed).unwrap();
    assert_eq!(seed.backend.puts(), vec![seed.index_name.clone()]);

    seed.backend.clear_operations();
    let stats = run_repair(&seed).unwrap();
    assert!(stats.remote.unwrap().synchronized);
    assert!(seed.backend.operations().is_empty());
}

#[test]
fn missing_index_volume_is_rebuilt_under_its_original_name() {
    let seed = seed_repository();
    seed.backend.remove(&seed.index_name);

    let stats = run_repair(&seed).unwrap();
    assert_eq!(stats.remote.unwrap().volumes_reuploaded, 1);
    assert_eq!(seed.backend.puts(), vec![seed.index_name.clone()]);
    assert!(seed.backend.deletes().is_empty());
    assert_eq!(seed.backend.queued_count(), 0);

    // The row carries the measured identity of the new bytes.
    let db = open_db(&seed);
    let row = db.get_remote_volume(&seed.index_name).unwrap();
    assert_eq!(row.state, VolumeState::Verified);
    let remote_bytes = seed.backend.object(&seed.index_name).unwrap();
    assert_eq!(row.size, remote_bytes.len() as i64);
    let file = write_temp(&remote_bytes);
    let (hash, _) = HashAlgorithm::Sha256.hash_file(file.path()).unwrap();
    assert_eq!(row.hash.as_deref(), Some(hash.as_str()));

    // The rebuilt archive covers the Blocks volume and its block.
    let payload: IndexPayload = read_payload(file.path()).unwrap();
    assert_eq!(payload.volumes.len(), 1);
    assert_eq!(payload.volumes[0].volume_name, seed.data_name);
    assert_eq!(
        payload.volumes[0].blocks,
        vec![(seed.block_hash.clone(), TEST_BLOCKSIZE as i64)]
    );
    assert!(!db.terminated_with_active_uploads());
}

#[test]
fn adoptable_extra_index_is_kept_not_deleted() {
    let seed = seed_repository();
    let (extra_name, bytes) = build_adoptable_index(&seed);
    seed.backend.insert(&extra_name, bytes);

    let stats = run_repair(&seed).unwrap();
    let remote = stats.remote.unwrap();
    assert_eq!(remote.indexes_adopted, 1);
    assert_eq!(remote.extras_deleted, 0);
    assert!(seed.backend.puts().is_empty());
    assert!(seed.backend.deletes().is_empty());

    let db = open_db(&seed);
    let row = db.get_remote_volume(&extra_name).unwrap();
    assert_eq!(row.state, VolumeState::Verified);
    let covered = db.get_block_volumes_from_index_name(&extra_name);
    assert_eq!(covered.len(), 1);
    assert_eq!(covered[0].name, seed.data_name);
}

#[test]
fn unadoptable_extra_index_is_deleted() {
    let seed = seed_repository();
    // Claims a Blocks volume the database has never heard of.
    let name =
        VolumeName::generate(&seed.options.prefix, VolumeKind::Index, seed.time, "zstd").format();
    let mut writer = IndexVolumeWriter::new(name.clone(), Codec::Zstd);
    writer.start_volume("darner-bunknown.zstd", "nohash", 1);
    writer.add_block(seed.block_hash.clone(), TEST_BLOCKSIZE as i64).unwrap();
    let closed = writer.close().unwrap();
    seed.backend.insert(&name, std::fs::read(closed.path()).unwrap());

    run_repair(&seed).unwrap();
    assert_eq!(seed.backend.deletes(), vec![name.clone()]);
    assert!(open_db(&seed).get_remote_volume(&name).is_none());
}

#[test]
fn extra_garbage_file_is_deleted_without_a_row() {
    let seed = seed_repository();
    seed.backend.insert("garbage.txt", b"not a volume".to_vec());

    let stats = run_repair(&seed).unwrap();
    assert_eq!(stats.remote.unwrap().extras_deleted, 1);
    assert_eq!(seed.backend.deletes(), vec!["garbage.txt".to_string()]);
    assert!(open_db(&seed).get_remote_volume("garbage.txt").is_none());
}

#[test]
fn missing_blocks_volume_requires_opt_in() {
    let seed = seed_repository();
    seed.backend.remove(&seed.data_name);

    let err = run_repair(&seed).unwrap_err();
    assert_eq!(err.help_id(), Some("MissingDblockFiles"));
    match err {
        DarnerError::MissingDblockFiles(names) => assert_eq!(names, vec![seed.data_name.clone()]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(seed.backend.puts().is_empty());
}

#[test]
fn missing_blocks_volume_is_rebuilt_from_the_local_source_file() {
    let mut seed = seed_repository();
    seed.options.rebuild_missing_block_volumes = true;
    seed.backend.remove(&seed.data_name);

    let stats = run_repair(&seed).unwrap();
    assert_eq!(stats.remote.unwrap().volumes_reuploaded, 1);
    assert_eq!(seed.backend.puts(), vec![seed.data_name.clone()]);

    let db = open_db(&seed);
    let row = db.get_remote_volume(&seed.data_name).unwrap();
    assert_eq!(row.state, VolumeState::Verified);

    let remote_bytes = seed.backend.object(&seed.data_name).unwrap();
    let file = write_temp(&remote_bytes);
    let payload: BlocksPayload = read_payload(file.path()).unwrap();
    assert_eq!(payload.blocks.len(), 1);
    assert_eq!(payload.blocks[0].hash, seed.block_hash);
    assert_eq!(payload.blocks[0].data, seed.block_data);
}

#[test]
fn missing_blocks_volume_is_rebuilt_from_a_donor_volume() {
    let mut seed = seed_repository();
    seed.options.rebuild_missing_block_volumes = true;

    // A second Blocks volume holds a surviving copy of the block.
    let donor_name =
        VolumeName::generate(&seed.options.prefix, VolumeKind::Blocks, seed.time, "zstd").format();
    let mut writer = BlockVolumeWriter::new(donor_name.clone(), Codec::Zstd);
    writer.append_block(seed.block_hash.clone(), seed.block_data.clone());
    let closed = writer.close().unwrap();
    let (donor_hash, donor_size) = HashAlgorithm::Sha256.hash_file(closed.path()).unwrap();
    seed.backend.insert(&donor_name, std::fs::read(closed.path()).unwrap());

    let mut db = open_db(&seed);
    let donor_id =
        db.register_remote_volume(&donor_name, VolumeKind::Blocks, VolumeState::Verified, seed.time);
    db.update_remote_volume(&donor_name, VolumeState::Verified, donor_size, Some(&donor_hash))
        .unwrap();
    db.register_block(&seed.block_hash, TEST_BLOCKSIZE as i64, donor_id);
    db.commit("AddDonorVolume").unwrap();
    drop(db);

    // Home volume gone, local source gone: only the donor remains.
    seed.backend.remove(&seed.data_name);
    std::fs::remove_file(&seed.source_path).unwrap();

    run_repair(&seed).unwrap();
    assert!(seed.backend.puts().contains(&seed.data_name));
    let remote_bytes = seed.backend.object(&seed.data_name).unwrap();
    let file = write_temp(&remote_bytes);
    let payload: BlocksPayload = read_payload(file.path()).unwrap();
    assert_eq!(payload.blocks[0].data, seed.block_data);
}

#[test]
fn unrecoverable_block_fails_loudly_without_uploading() {
    let mut seed = seed_repository();
    seed.options.rebuild_missing_block_volumes = true;
    seed.backend.remove(&seed.data_name);
    std::fs::remove_file(&seed.source_path).unwrap();

    let db_before = std::fs::read(&seed.options.dbpath).unwrap();
    let err = run_repair(&seed).unwrap_err();
    assert_eq!(err.help_id(), Some("RepairIsNotPossible"));
    match err {
        DarnerError::RepairIsNotPossible { missing, filesets } => {
            assert_eq!(missing, 1);
            assert_eq!(filesets, vec![seed.time]);
        }
        other => panic!("unexpected error: {other}"),
    }
    // Never a partial volume, never a database mutation.
    assert!(seed.backend.puts().is_empty());
    assert_eq!(std::fs::read(&seed.options.dbpath).unwrap(), db_before);
    let db = open_db(&seed);
    assert_eq!(
        db.get_remote_volume(&seed.data_name).unwrap().state,
        VolumeState::Verified
    );
}

#[test]
fn remote_newer_than_database_fails_before_any_mutation() {
    let seed = seed_repository();
    let newer_time = seed.time + Duration::hours(1);
    let (name, bytes) = build_empty_fileset_volume(&seed, newer_time);
    seed.backend.insert(&name, bytes);

    let db_before = std::fs::read(&seed.options.dbpath).unwrap();
    let err = run_repair(&seed).unwrap_err();
    assert_eq!(err.help_id(), Some("RemoteFilesNewerThanLocalDatabase"));
    assert!(seed.backend.operations().is_empty());
    assert_eq!(std::fs::read(&seed.options.dbpath).unwrap(), db_before);
}

#[test]
fn ignore_outdated_database_recreates_the_newer_fileset_locally() {
    let mut seed = seed_repository();
    seed.options.repair_ignore_outdated_database = true;
    let newer_time = seed.time + Duration::hours(1);
    let (name, bytes) = build_empty_fileset_volume(&seed, newer_time);
    seed.backend.insert(&name, bytes);

    let stats = run_repair(&seed).unwrap();
    assert_eq!(stats.remote.unwrap().filesets_recreated, 1);

    let db = open_db(&seed);
    let row = db.get_remote_volume(&name).unwrap();
    assert_eq!(row.state, VolumeState::Verified);
    let fileset = db.filesets().iter().find(|f| f.time == newer_time).unwrap();
    assert_eq!(db.get_remote_volume_from_fileset_id(fileset.id).unwrap().name, name);
}

#[test]
fn older_unknown_fileset_volume_is_recreated_not_deleted() {
    let seed = seed_repository();
    let older_time = seed.time - Duration::hours(1);
    let (name, bytes) = build_empty_fileset_volume(&seed, older_time);
    seed.backend.insert(&name, bytes);

    let stats = run_repair(&seed).unwrap();
    assert_eq!(stats.remote.unwrap().filesets_recreated, 1);
    assert!(seed.backend.deletes().is_empty());
    assert!(open_db(&seed).filesets().iter().any(|f| f.time == older_time));
}

#[test]
fn fileset_without_remote_volume_is_reuploaded_under_a_fresh_name() {
    let seed = seed_repository();
    let mut db = open_db(&seed);
    db.update_remote_volume(&seed.fileset_name, VolumeState::Deleted, -1, None)
        .unwrap();
    db.commit("SimulateLostFilesetVolume").unwrap();
    drop(db);
    seed.backend.remove(&seed.fileset_name);

    let stats = run_repair(&seed).unwrap();
    assert_eq!(stats.remote.unwrap().filesets_reuploaded, 1);

    let puts = seed.backend.puts();
    assert_eq!(puts.len(), 1);
    assert_ne!(puts[0], seed.fileset_name);

    let db = open_db(&seed);
    let row = db.get_remote_volume(&puts[0]).unwrap();
    assert_eq!(row.kind, VolumeKind::Files);
    assert_eq!(row.state, VolumeState::Verified);
    assert!(!db.terminated_with_active_uploads());
}

#[test]
fn empty_index_volume_is_deleted() {
    let seed = seed_repository();
    let name =
        VolumeName::generate(&seed.options.prefix, VolumeKind::Index, seed.time, "zstd").format();
    let writer = IndexVolumeWriter::new(name.clone(), Codec::Zstd);
    let closed = writer.close().unwrap();
    let (hash, size) = HashAlgorithm::Sha256.hash_file(closed.path()).unwrap();
    assert!(size <= 2048, "fixture index should be tiny, got {size}");
    seed.backend.insert(&name, std::fs::read(closed.path()).unwrap());

    let mut db = open_db(&seed);
    db.register_remote_volume(&name, VolumeKind::Index, VolumeState::Verified, seed.time);
    db.update_remote_volume(&name, VolumeState::Verified, size, Some(&hash)).unwrap();
    db.commit("AddEmptyIndex").unwrap();
    drop(db);

    let stats = run_repair(&seed).unwrap();
    assert_eq!(stats.remote.unwrap().empty_indexes_deleted, 1);
    assert_eq!(seed.backend.deletes(), vec![name.clone()]);
    assert_eq!(
        open_db(&seed).get_remote_volume(&name).unwrap().state,
        VolumeState::Deleted
    );
}

#[test]
fn crashed_upload_is_verified_and_promoted() {
    let seed = seed_repository();
    let mut db = open_db(&seed);
    // Simulate a crash mid-upload: the object landed but the row never
    // advanced past Uploading.
    db.update_remote_volume(&seed.data_name, VolumeState::Uploading, -1, None)
        .unwrap();
    db.commit("SimulateCrashedUpload").unwrap();
    drop(db);

    let stats = run_repair(&seed).unwrap();
    assert_eq!(stats.remote.unwrap().volumes_verified, 1);
    let db = open_db(&seed);
    let row = db.get_remote_volume(&seed.data_name).unwrap();
    assert_eq!(row.state, VolumeState::Verified);
    assert_eq!(row.hash.as_deref(), Some(seed.data_hash.as_str()));
    assert_eq!(row.size, seed.data_size);
}

#[test]
fn dry_run_diagnoses_without_touching_either_store() {
    let mut seed = seed_repository();
    seed.backend.remove(&seed.index_name);
    seed.backend.insert("garbage.txt", b"junk".to_vec());

    seed.options.dry_run = true;
    let db_before = std::fs::read(&seed.options.dbpath).unwrap();
    let remote_before = seed.backend.snapshot();

    let stats = run_repair(&seed).unwrap();
    let remote = stats.remote.unwrap();
    assert_eq!(remote.extras_deleted, 1);
    assert_eq!(remote.volumes_reuploaded, 1);

    assert!(seed.backend.operations().is_empty());
    assert_eq!(seed.backend.snapshot(), remote_before);
    assert_eq!(std::fs::read(&seed.options.dbpath).unwrap(), db_before);

    // The real run performs exactly what the dry run diagnosed.
    seed.options.dry_run = false;
    run_repair(&seed).unwrap();
    assert_eq!(seed.backend.puts(), vec![seed.index_name.clone()]);
    assert_eq!(seed.backend.deletes(), vec!["garbage.txt".to_string()]);
}

#[test]
fn cancellation_aborts_and_leaves_the_queue_quiescent() {
    let seed = seed_repository();
    seed.backend.remove(&seed.index_name);

    let cancel = AtomicBool::new(true);
    let err = repair::run(
        &seed.backend,
        RepairRequest {
            options: &seed.options,
            filter: &PathFilter::empty(),
            recreate: None,
            progress: None,
            cancel: Some(&cancel),
        },
    )
    .unwrap_err();
    assert!(err.is_abort());
    assert!(seed.backend.puts().is_empty());
    assert_eq!(seed.backend.queued_count(), 0);
    // Observed again so a fresh flag does not abort.
    cancel.store(false, Ordering::SeqCst);
    run_repair(&seed).unwrap();
    assert_eq!(seed.backend.puts(), vec![seed.index_name.clone()]);
}

#[test]
fn progress_reaches_completion() {
    let seed = seed_repository();
    seed.backend.remove(&seed.index_name);

    let mut fractions: Vec<f32> = Vec::new();
    {
        let mut sink = |f: f32| fractions.push(f);
        repair::run(
            &seed.backend,
            RepairRequest {
                options: &seed.options,
                filter: &PathFilter::empty(),
                recreate: None,
                progress: Some(&mut sink),
                cancel: None,
            },
        )
        .unwrap();
    }
    assert_eq!(fractions.last().copied(), Some(1.0));
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn broken_fileset_is_repopulated_from_its_remote_volume() {
    let seed = seed_repository();
    let mut db = open_db(&seed);
    let fileset_id = db.get_fileset_id_from_remotename(&seed.fileset_name).unwrap();
    // A recreate artifact: an entry referencing a block nobody has.
    let bogus = HashAlgorithm::Sha256.hash_base64(b"no such block");
    db.add_file_entry(FileEntryRow {
        fileset_id,
        path: "/phantom.bin".into(),
        file_type: FileType::File,
        size: TEST_BLOCKSIZE as i64,
        meta_hash: String::new(),
        block_hashes: vec![bogus],
        blocklist_hash: None,
    });
    db.commit("InjectBrokenEntry").unwrap();
    drop(db);

    let stats = run_repair(&seed).unwrap();
    assert_eq!(stats.broken_filesets_repaired, 1);

    let db = open_db(&seed);
    let entries = db.file_entries(fileset_id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].block_hashes, vec![seed.block_hash.clone()]);
}

#[test]
fn verification_manifest_is_uploaded_on_request() {
    let mut seed = seed_repository();
    seed.options.upload_verification_file = true;

    run_repair(&seed).unwrap();
    let name = crate::verification::verification_name(&seed.options.prefix);
    assert_eq!(seed.backend.puts(), vec![name.clone()]);

    let bytes = seed.backend.object(&name).unwrap();
    let entries: Vec<crate::verification::VerificationEntry> =
        serde_json::from_slice(&bytes).unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().any(|e| e.name == seed.data_name));

    // The manifest itself is never classified as an extra on the next run.
    seed.backend.clear_operations();
    seed.options.upload_verification_file = false;
    run_repair(&seed).unwrap();
    assert!(seed.backend.deletes().is_empty());
}

#[test]
fn passphrase_change_is_rejected_up_front() {
    let mut seed = seed_repository();
    seed.options.allow_passphrase_change = true;
    let err = run_repair(&seed).unwrap_err();
    assert_eq!(err.help_id(), Some("PassphraseChangeUnsupported"));
}

#[test]
fn repairing_without_a_database_requires_a_recreate_handler() {
    let seed = seed_repository();
    std::fs::remove_file(&seed.options.dbpath).unwrap();
    let err = run_repair(&seed).unwrap_err();
    assert_eq!(err.help_id(), Some("DatabaseDoesNotExist"));
}

#[test]
fn foreign_prefix_volumes_are_never_touched() {
    let seed = seed_repository();
    let foreign =
        VolumeName::generate("otherrepo", VolumeKind::Blocks, seed.time, "zstd").format();
    seed.backend.insert(&foreign, b"someone else's backup".to_vec());

    run_repair(&seed).unwrap();
    assert!(seed.backend.operations().is_empty());
    assert!(seed.backend.contains(&foreign));
}
