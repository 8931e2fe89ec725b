use std::path::Path;

use tracing::{debug, info, warn};

use crate::compress::Codec;
use crate::config::{IndexFilePolicy, PathFilter, RepairOptions};
use crate::db::{consistency, FilesetRow, LocalStateDatabase, RemoteVolumeRow};
use crate::error::{DarnerError, Result};
use crate::hash::HashAlgorithm;
use crate::progress::RepairControl;
use crate::storage::Backend;
use crate::volume::name::{parse_with_prefix, VolumeName};
use crate::volume::payload::{read_payload, BlocksPayload, FilesetPayload, IndexPayload};
use crate::volume::writer::{ClosedVolume, IndexVolumeWriter};
use crate::volume::{VolumeKind, VolumeState};

use super::analyzer::{self, ExtraVolume, UnknownFilesetVolume};
use super::block_locator::{rebuild_blocks_volume, RebuildOutcome};
use super::fileset::{build_fileset_volume, reconstruct_fileset};

/// Counters from one remote reconciliation run.
#[derive(Debug, Default)]
pub struct RemoteRepairStats {
    pub volumes_verified: usize,
    pub extras_deleted: usize,
    pub indexes_adopted: usize,
    pub filesets_reuploaded: usize,
    pub filesets_recreated: usize,
    pub volumes_reuploaded: usize,
    pub empty_indexes_deleted: usize,
    pub rows_cleaned: usize,
    /// True when no discrepancy of any class was found.
    pub synchronized: bool,
}

/// A volume uploaded during this run, promoted to Verified after the drain.
struct PendingVerification {
    name: String,
    size: i64,
    hash: String,
}

/// Errors that abort the whole reconciliation instead of skipping one item:
/// cancellation, user-facing conditions, and internal-consistency failures
/// that no retry can fix.
fn is_fatal(e: &DarnerError) -> bool {
    e.is_abort() || e.help_id().is_some() || matches!(e, DarnerError::InternalConsistency(_))
}

/// Reconcile the remote store against the database: verify, clean up, and
/// reupload until both agree. Phase order is fixed; see the phase functions.
pub fn run_repair_remote(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    control: &mut RepairControl,
) -> Result<RemoteRepairStats> {
    match run_phases(backend, db, options, control) {
        Ok(stats) => Ok(stats),
        Err(e) if e.is_abort() => {
            // Leave the queue quiescent; the active-uploads flag stays set so
            // the next start knows uploads may be dangling.
            if let Err(drain) = backend.wait_for_empty() {
                warn!(error = %drain, "failed to drain backend queue after cancellation");
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn run_phases(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    control: &mut RepairControl,
) -> Result<RemoteRepairStats> {
    // Preconditions, all fatal.
    if !options.dbpath.exists() {
        return Err(DarnerError::RepairDatabaseFileDoesNotExist(
            options.dbpath.display().to_string(),
        ));
    }
    if db.partially_recreated() {
        return Err(DarnerError::DatabaseIsPartiallyRecreated);
    }
    if db.repair_in_progress() {
        return Err(DarnerError::DatabaseIsInRepairState);
    }
    consistency::verify_consistency_for_repair(db, options.blocksize)?;

    let exempt = db.get_last_incomplete_fileset_volume();
    let analysis = analyzer::analyze(backend, db, &options.prefix, exempt.as_deref())?;

    // Freshness: repairing against an older database would delete newer
    // remote data.
    if let Some(remote_max) = analysis.max_remote_time {
        let local_max = db
            .fileset_times()
            .iter()
            .map(|&(_, time)| time)
            .max()
            .ok_or(DarnerError::LocalDatabaseHasNoFilesetTimes)?;
        if remote_max > local_max {
            if options.repair_ignore_outdated_database {
                warn!(
                    %remote_max,
                    %local_max,
                    "remote store is newer than the local database; proceeding as requested"
                );
            } else {
                return Err(DarnerError::RemoteFilesNewerThanLocalDatabase {
                    remote: remote_max,
                    local: local_max,
                });
            }
        }
    }

    // Sanity checks that catch a mistyped prefix or a database that should be
    // recreated rather than repaired. Diagnose only.
    if analysis.parsed.is_empty()
        && !analysis.extra_volumes.is_empty()
        && !analysis.foreign_prefixes.is_empty()
    {
        return Err(DarnerError::RemoteFolderEmptyWithPrefix {
            prefix: options.prefix.clone(),
            others: analysis.foreign_prefixes.clone(),
        });
    }
    if analysis.parsed.is_empty()
        && analysis
            .extra_volumes
            .iter()
            .any(|e| e.parsed.as_ref().map_or(false, |p| p.prefix == options.prefix))
    {
        return Err(DarnerError::NoRemoteFilesMissing);
    }

    let mut stats = RemoteRepairStats::default();

    // Local-only tidying: rows whose remote object never materialized. The
    // in-memory removal also runs in dry-run (nothing is ever committed
    // there), so both modes diagnose the same downstream discrepancies.
    for name in &analysis.cleanup_rows {
        db.remove_remote_volume(name);
        if options.dry_run {
            info!(name = name.as_str(), "would remove dangling volume row");
        } else {
            info!(name = name.as_str(), "removed dangling volume row");
        }
        stats.rows_cleaned += 1;
    }

    let missing_remote_filesets = db.missing_remote_filesets();
    let mut missing_local = analysis.missing_local_filesets.clone();
    for row in db.missing_local_filesets() {
        if missing_local.iter().any(|u| u.name == row.name) {
            continue;
        }
        if let Some(parsed) = parse_with_prefix(&row.name, &options.prefix) {
            missing_local.push(UnknownFilesetVolume {
                name: row.name.clone(),
                parsed,
                size: row.size,
            });
        }
    }
    let empty_indexes = db.empty_index_files();

    let target = analysis.extra_volumes.len()
        + analysis.missing_volumes.len()
        + analysis.verification_required.len()
        + missing_remote_filesets.len()
        + missing_local.len()
        + empty_indexes.len();
    control.set_target(target);

    if target == 0 {
        info!("DatabaseIsSynchronized: local database and remote store agree");
        stats.synchronized = true;
        control.publish_done();
        backend.wait_for_empty()?;
        if !options.dry_run && stats.rows_cleaned > 0 {
            db.commit("CleanupDanglingRows")?;
        }
        return Ok(stats);
    }

    let algorithm = HashAlgorithm::from_config(&options.block_hash_algorithm)?;
    let mut upload_flag_set = false;
    let mut pending_verify: Vec<PendingVerification> = Vec::new();

    phase_verify(backend, db, options, control, &analysis.verification_required, algorithm, &mut stats)?;
    phase_extras(backend, db, options, control, &analysis.extra_volumes, algorithm, &mut stats)?;

    // Guard: rebuilding Blocks volumes needs an explicit opt-in, because it
    // scans source files and sibling volumes and may not succeed.
    let missing_blocks: Vec<String> = analysis
        .missing_volumes
        .iter()
        .filter(|v| v.kind == VolumeKind::Blocks)
        .map(|v| v.name.clone())
        .collect();
    if !missing_blocks.is_empty() && !options.rebuild_missing_block_volumes {
        return Err(DarnerError::MissingDblockFiles(missing_blocks));
    }

    phase_missing_remote_filesets(
        backend,
        db,
        options,
        control,
        &missing_remote_filesets,
        &mut upload_flag_set,
        &mut pending_verify,
        &mut stats,
    )?;
    phase_missing_local_filesets(backend, db, options, control, &missing_local, &mut stats)?;
    phase_missing_volumes(
        backend,
        db,
        options,
        control,
        &analysis.missing_volumes,
        algorithm,
        &mut upload_flag_set,
        &mut pending_verify,
        &mut stats,
    )?;

    // Drain the upload queue, then promote everything that landed and clear
    // the active-uploads flag. The flag stays set if we never get here.
    backend.wait_for_empty()?;
    if !options.dry_run {
        for pending in pending_verify.drain(..) {
            db.update_remote_volume(
                &pending.name,
                VolumeState::Verified,
                pending.size,
                Some(&pending.hash),
            )?;
        }
        if upload_flag_set {
            db.set_terminated_with_active_uploads(false);
        }
        db.commit("PostUploadDrain")?;
    }

    phase_empty_indexes(backend, db, options, control, &empty_indexes, &mut stats)?;

    control.publish_done();
    backend.wait_for_empty()?;
    Ok(stats)
}

/// Phase 1: measure crashed-mid-upload volumes against what actually landed.
/// All row updates share one transaction committed at phase end.
fn phase_verify(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    control: &mut RepairControl,
    rows: &[RemoteVolumeRow],
    algorithm: HashAlgorithm,
    stats: &mut RemoteRepairStats,
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    for row in rows {
        control.checkpoint()?;
        control.advance();
        match verify_one_volume(backend, row, algorithm) {
            Ok((size, hash)) => {
                if options.dry_run {
                    info!(name = row.name.as_str(), "would mark volume verified");
                } else {
                    db.update_remote_volume(&row.name, VolumeState::Verified, size, Some(&hash))?;
                }
                stats.volumes_verified += 1;
            }
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(name = row.name.as_str(), error = %e, "RemoteFileVerificationError: skipping volume");
            }
        }
    }
    if !options.dry_run {
        db.commit("CommitVerificationTransaction")?;
    }
    Ok(())
}

fn verify_one_volume(
    backend: &dyn Backend,
    row: &RemoteVolumeRow,
    algorithm: HashAlgorithm,
) -> Result<(i64, String)> {
    let fetched = backend.get_with_info(&row.name)?;
    verify_volume_internals(fetched.file.path(), row.kind, algorithm)?;
    Ok((fetched.size, fetched.hash))
}

/// Decompress an archive and re-check every piece of content it claims.
fn verify_volume_internals(path: &Path, kind: VolumeKind, algorithm: HashAlgorithm) -> Result<()> {
    match kind {
        VolumeKind::Blocks => {
            let payload: BlocksPayload = read_payload(path)?;
            for block in &payload.blocks {
                if algorithm.hash_base64(&block.data) != block.hash {
                    return Err(DarnerError::InvalidFormat(format!(
                        "block {} fails its hash",
                        block.hash
                    )));
                }
            }
        }
        VolumeKind::Index => {
            let payload: IndexPayload = read_payload(path)?;
            for blocklist in &payload.blocklists {
                if algorithm.hash_base64(&blocklist.data) != blocklist.hash {
                    return Err(DarnerError::InvalidFormat(format!(
                        "blocklist {} fails its hash",
                        blocklist.hash
                    )));
                }
            }
        }
        VolumeKind::Files => {
            let _: FilesetPayload = read_payload(path)?;
        }
    }
    Ok(())
}

/// Phase 2: extras. Index volumes may be adopted when they check out against
/// the database; everything else is deleted.
fn phase_extras(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    control: &mut RepairControl,
    extras: &[ExtraVolume],
    algorithm: HashAlgorithm,
    stats: &mut RemoteRepairStats,
) -> Result<()> {
    if extras.is_empty() {
        return Ok(());
    }
    for extra in extras {
        control.checkpoint()?;
        control.advance();

        let is_index = extra
            .parsed
            .as_ref()
            .map_or(false, |p| p.kind == VolumeKind::Index);
        if is_index && options.index_file_policy != IndexFilePolicy::None {
            match try_adopt_index(backend, db, options, extra, algorithm) {
                Ok(true) => {
                    stats.indexes_adopted += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    debug!(name = extra.name.as_str(), error = %e, "index adoption failed; deleting");
                }
            }
        }

        if options.dry_run {
            info!(name = extra.name.as_str(), "would delete extra remote file");
            stats.extras_deleted += 1;
            continue;
        }
        match delete_remote(backend, db, &extra.name, extra.size) {
            Ok(()) => stats.extras_deleted += 1,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(name = extra.name.as_str(), error = %e, "FailedExtraFileCleanup: skipping");
            }
        }
    }
    if !options.dry_run {
        db.commit("ExtraVolumeCleanup")?;
    }
    Ok(())
}

/// Delete a remote object, tracking the lifecycle in the database when the
/// object is known there. Unknown names never gain a row.
fn delete_remote(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    name: &str,
    size: i64,
) -> Result<()> {
    let known = db.get_remote_volume(name).is_some();
    if known {
        db.update_remote_volume(name, VolumeState::Deleting, -1, None)?;
    }
    backend.delete(name, size)?;
    if known {
        db.update_remote_volume(name, VolumeState::Deleted, -1, None)?;
    }
    info!(name, "deleted extra remote file");
    Ok(())
}

/// Adoption: an unknown index volume is kept when everything it claims is
/// already true in the database. Returns Ok(false) when any check fails.
fn try_adopt_index(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    extra: &ExtraVolume,
    algorithm: HashAlgorithm,
) -> Result<bool> {
    if db.get_remote_volume(&extra.name).is_some() {
        // Known rows reach the extras list only in non-durable states, which
        // adoption cannot fix.
        return Ok(false);
    }

    let fetched = backend.get_with_info(&extra.name)?;
    let payload: IndexPayload = read_payload(fetched.file.path())?;
    if payload.volumes.is_empty() {
        return Ok(false);
    }

    let mut covered = Vec::new();
    for entry in &payload.volumes {
        let Some(row) = db.get_remote_volume(&entry.volume_name) else {
            return Ok(false);
        };
        if !matches!(
            row.state,
            VolumeState::Uploading | VolumeState::Uploaded | VolumeState::Verified
        ) {
            return Ok(false);
        }
        if row.size >= 0 && entry.volume_size >= 0 && row.size != entry.volume_size {
            return Ok(false);
        }
        if let (Some(known), hash) = (&row.hash, &entry.volume_hash) {
            if known != hash {
                return Ok(false);
            }
        }
        if !db.check_all_blocks_are_in_volume(row.id, &entry.blocks) {
            return Ok(false);
        }
        covered.push(row.id);
    }

    let hash_size = algorithm.digest_len();
    for blocklist in &payload.blocklists {
        if blocklist.data.is_empty()
            || blocklist.data.len() % hash_size != 0
            || blocklist.data.len() > options.blocksize
        {
            return Ok(false);
        }
        if algorithm.hash_base64(&blocklist.data) != blocklist.hash {
            return Ok(false);
        }
    }

    if options.dry_run {
        info!(name = extra.name.as_str(), "would adopt extra index volume");
        return Ok(true);
    }

    let parsed = extra
        .parsed
        .as_ref()
        .ok_or_else(|| DarnerError::InvalidVolumeName(extra.name.clone()))?;
    db.register_remote_volume(&extra.name, VolumeKind::Index, VolumeState::Uploading, parsed.time);
    db.update_remote_volume(&extra.name, VolumeState::Uploading, fetched.size, Some(&fetched.hash))?;
    let index_id = db.get_remote_volume_id(&extra.name).expect("row just registered");
    for blocks_id in covered {
        db.add_index_block_link(index_id, blocks_id);
    }
    db.commit("AdoptIndexVolume")?;
    db.update_remote_volume(&extra.name, VolumeState::Verified, -1, None)?;
    db.commit("AdoptIndexVolumeVerified")?;
    info!(name = extra.name.as_str(), "adopted extra index volume");
    Ok(true)
}

/// Phase 4: database filesets with no remote volume get a fresh name and a
/// rebuilt Files volume.
#[allow(clippy::too_many_arguments)]
fn phase_missing_remote_filesets(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    control: &mut RepairControl,
    filesets: &[FilesetRow],
    upload_flag_set: &mut bool,
    pending_verify: &mut Vec<PendingVerification>,
    stats: &mut RemoteRepairStats,
) -> Result<()> {
    for fileset in filesets {
        control.checkpoint()?;
        control.advance();

        let codec = Codec::from_id(&options.compression_module)?;
        let name = fresh_unused_name(db, &options.prefix, VolumeKind::Files, fileset, codec);

        if options.dry_run {
            info!(
                time = %fileset.time,
                name = name.as_str(),
                "would rebuild and upload missing fileset volume"
            );
            stats.filesets_reuploaded += 1;
            continue;
        }

        match reupload_fileset(backend, db, options, fileset.id, &name, codec, upload_flag_set) {
            Ok(pending) => {
                pending_verify.push(pending);
                stats.filesets_reuploaded += 1;
            }
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(time = %fileset.time, error = %e, "CleanupMissingFileError: failed to reupload fileset");
            }
        }
    }
    Ok(())
}

fn fresh_unused_name(
    db: &LocalStateDatabase,
    prefix: &str,
    kind: VolumeKind,
    fileset: &FilesetRow,
    codec: Codec,
) -> String {
    loop {
        let candidate = VolumeName::generate(prefix, kind, fileset.time, codec.id()).format();
        if db.get_remote_volume(&candidate).is_none() {
            return candidate;
        }
    }
}

fn reupload_fileset(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    fileset_id: i64,
    name: &str,
    codec: Codec,
    upload_flag_set: &mut bool,
) -> Result<PendingVerification> {
    let closed = build_fileset_volume(db, options, fileset_id, name, codec)?;
    let (hash, size) = HashAlgorithm::Sha256.hash_file(closed.path())?;

    let parsed_time = db
        .filesets()
        .iter()
        .find(|f| f.id == fileset_id)
        .map(|f| f.time)
        .expect("fileset exists");
    let volume_id = db.register_remote_volume(name, VolumeKind::Files, VolumeState::Temporary, parsed_time);
    db.update_remote_volume(name, VolumeState::Temporary, size, Some(&hash))?;
    db.link_fileset_to_volume(fileset_id, volume_id);
    db.commit("RegisterRebuiltFileset")?;

    set_upload_flag(db, upload_flag_set)?;
    db.update_remote_volume(name, VolumeState::Uploading, -1, None)?;
    db.commit("RebuiltFilesetUploading")?;
    backend.put(name, closed.path())?;
    db.update_remote_volume(name, VolumeState::Uploaded, size, Some(&hash))?;
    info!(name, size, "re-uploaded missing fileset volume");
    Ok(PendingVerification {
        name: name.to_string(),
        size,
        hash,
    })
}

/// Durably record that uploads are in flight before the first put; the flag
/// is cleared only after the post-phase drain.
fn set_upload_flag(db: &mut LocalStateDatabase, upload_flag_set: &mut bool) -> Result<()> {
    if !*upload_flag_set {
        db.set_terminated_with_active_uploads(true);
        db.commit("SetActiveUploadsFlag")?;
        *upload_flag_set = true;
    }
    Ok(())
}

/// Phase 5: remote fileset volumes with no local fileset are parsed and
/// their rows recreated locally. Commits once per volume.
fn phase_missing_local_filesets(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    control: &mut RepairControl,
    unknown: &[UnknownFilesetVolume],
    stats: &mut RemoteRepairStats,
) -> Result<()> {
    for volume in unknown {
        control.checkpoint()?;
        control.advance();

        // The codec id comes from the filename; an unknown id is fatal.
        Codec::from_id(&volume.parsed.codec)?;

        if options.dry_run {
            info!(
                name = volume.name.as_str(),
                "would recreate local fileset from remote volume"
            );
            stats.filesets_recreated += 1;
            continue;
        }

        match recreate_local_fileset(backend, db, volume) {
            Ok(entries) => {
                info!(
                    name = volume.name.as_str(),
                    entries, "recreated local fileset from remote volume"
                );
                stats.filesets_recreated += 1;
            }
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(name = volume.name.as_str(), error = %e, "RemoteFileAccessError: failed to recreate fileset");
            }
        }
    }
    Ok(())
}

fn recreate_local_fileset(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    volume: &UnknownFilesetVolume,
) -> Result<usize> {
    let fetched = backend.get_with_info(&volume.name)?;
    let payload: FilesetPayload = read_payload(fetched.file.path())?;

    let volume_id = match db.get_remote_volume_id(&volume.name) {
        Some(id) => id,
        None => db.register_remote_volume(
            &volume.name,
            VolumeKind::Files,
            VolumeState::Uploaded,
            volume.parsed.time,
        ),
    };
    db.update_remote_volume(
        &volume.name,
        VolumeState::Verified,
        fetched.size,
        Some(&fetched.hash),
    )?;

    let fileset_id = db.create_fileset(Some(volume_id), volume.parsed.time, payload.is_full_backup);
    let entries = reconstruct_fileset(db, fileset_id, &payload, &PathFilter::empty());
    db.commit("RecreateLocalFileset")?;
    Ok(entries)
}

/// Phase 6: rebuild missing volumes per kind under their original names.
#[allow(clippy::too_many_arguments)]
fn phase_missing_volumes(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    control: &mut RepairControl,
    missing: &[RemoteVolumeRow],
    algorithm: HashAlgorithm,
    upload_flag_set: &mut bool,
    pending_verify: &mut Vec<PendingVerification>,
    stats: &mut RemoteRepairStats,
) -> Result<()> {
    for row in missing {
        control.checkpoint()?;
        control.advance();

        match rebuild_one_missing(
            backend,
            db,
            options,
            row,
            algorithm,
            upload_flag_set,
            pending_verify,
        ) {
            Ok(true) => stats.volumes_reuploaded += 1,
            Ok(false) => {}
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(name = row.name.as_str(), error = %e, "CleanupMissingFileError: failed to rebuild volume");
            }
        }
    }
    if !options.dry_run {
        db.commit("MissingVolumeReupload")?;
    }
    Ok(())
}

fn rebuild_one_missing(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    row: &RemoteVolumeRow,
    algorithm: HashAlgorithm,
    upload_flag_set: &mut bool,
    pending_verify: &mut Vec<PendingVerification>,
) -> Result<bool> {
    let parsed = parse_with_prefix(&row.name, &options.prefix)
        .ok_or_else(|| DarnerError::InvalidVolumeName(row.name.clone()))?;
    let codec = Codec::from_id(&parsed.codec)?;

    match row.kind {
        VolumeKind::Files => {
            let fileset_id = db
                .get_fileset_id_from_remotename(&row.name)
                .ok_or_else(|| {
                    DarnerError::Other(format!("missing fileset volume '{}' has no fileset", row.name))
                })?;
            if options.dry_run {
                info!(name = row.name.as_str(), "would rebuild and re-upload fileset volume");
                return Ok(true);
            }
            let closed = build_fileset_volume(db, options, fileset_id, &row.name, codec)?;
            upload_rebuilt(backend, db, &row.name, closed.path(), upload_flag_set, pending_verify)?;
            Ok(true)
        }
        VolumeKind::Index => {
            match rebuild_index_volume(db, options, row, codec, algorithm) {
                Ok(closed) => {
                    if options.dry_run {
                        info!(
                            name = row.name.as_str(),
                            size = closed.size,
                            "would rebuild and re-upload index volume"
                        );
                        return Ok(true);
                    }
                    upload_rebuilt(backend, db, &row.name, closed.path(), upload_flag_set, pending_verify)?;
                    Ok(true)
                }
                Err(e) if is_fatal(&e) => Err(e),
                Err(e) => {
                    warn!(name = row.name.as_str(), error = %e, "FailedNewIndexFile: could not rebuild index volume");
                    Ok(false)
                }
            }
        }
        VolumeKind::Blocks => match rebuild_blocks_volume(backend, db, options, row, codec)? {
            RebuildOutcome::Complete(closed) => {
                upload_rebuilt(backend, db, &row.name, closed.path(), upload_flag_set, pending_verify)?;
                Ok(true)
            }
            RebuildOutcome::DryRun { .. } => Ok(true),
        },
    }
}

/// Rebuild an index volume from the database: one start/add/finish triple per
/// covered Blocks volume, plus blocklist payloads under the Full policy.
/// Always builds in a temp file even in dry-run, so the would-be size is real.
fn rebuild_index_volume(
    db: &LocalStateDatabase,
    options: &RepairOptions,
    row: &RemoteVolumeRow,
    codec: Codec,
    algorithm: HashAlgorithm,
) -> Result<ClosedVolume> {
    let covered = db.get_block_volumes_from_index_name(&row.name);
    let mut writer = IndexVolumeWriter::new(row.name.clone(), codec);

    for volume in &covered {
        writer.start_volume(
            volume.name.clone(),
            volume.hash.clone().unwrap_or_default(),
            volume.size,
        );
        for (hash, size) in db.get_blocks(volume.id) {
            writer.add_block(hash, size)?;
        }
        writer.finish_volume();

        if options.index_file_policy == IndexFilePolicy::Full {
            for (hash, data) in db.get_blocklists(volume.id)? {
                // A self-check failure here means the database rows are
                // corrupt; retrying cannot fix it.
                if algorithm.hash_base64(&data) != hash {
                    return Err(DarnerError::InternalConsistency(format!(
                        "blocklist {hash} does not round-trip while rebuilding '{}'",
                        row.name
                    )));
                }
                writer.write_blocklist(hash, data);
            }
        }
    }

    let closed = writer.close()?;
    if options.dry_run {
        debug!(name = row.name.as_str(), size = closed.size, "dry-run index rebuild");
    }
    Ok(closed)
}

fn upload_rebuilt(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    name: &str,
    path: &Path,
    upload_flag_set: &mut bool,
    pending_verify: &mut Vec<PendingVerification>,
) -> Result<()> {
    let (hash, size) = HashAlgorithm::Sha256.hash_file(path)?;
    set_upload_flag(db, upload_flag_set)?;
    db.update_remote_volume(name, VolumeState::Uploading, -1, None)?;
    db.commit("RebuiltVolumeUploading")?;
    backend.put(name, path)?;
    db.update_remote_volume(name, VolumeState::Uploaded, size, Some(&hash))?;
    info!(name, size, "re-uploaded missing volume");
    pending_verify.push(PendingVerification {
        name: name.to_string(),
        size,
        hash,
    });
    Ok(())
}

/// Phase 8: delete index volumes whose manifest covers nothing. Anything
/// larger than the empty-manifest ceiling is suspicious and left alone.
const EMPTY_INDEX_MAX_SIZE: i64 = 2048;

fn phase_empty_indexes(
    backend: &dyn Backend,
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
    control: &mut RepairControl,
    empty: &[RemoteVolumeRow],
    stats: &mut RemoteRepairStats,
) -> Result<()> {
    if empty.is_empty() {
        return Ok(());
    }
    for row in empty {
        control.checkpoint()?;
        control.advance();

        if row.size > EMPTY_INDEX_MAX_SIZE {
            warn!(
                name = row.name.as_str(),
                size = row.size,
                "index volume looks empty but is large; leaving it alone"
            );
            continue;
        }
        if options.dry_run {
            info!(name = row.name.as_str(), "would delete empty index volume");
            stats.empty_indexes_deleted += 1;
            continue;
        }
        match delete_remote(backend, db, &row.name, row.size) {
            Ok(()) => stats.empty_indexes_deleted += 1,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(name = row.name.as_str(), error = %e, "CleanupEmptyIndexFileError: skipping");
            }
        }
    }
    if !options.dry_run {
        db.commit("EmptyIndexCleanup")?;
    }
    Ok(())
}
