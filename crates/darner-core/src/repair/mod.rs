pub mod analyzer;
pub mod block_locator;
pub mod fileset;
pub mod reconcile;

use std::path::Path;
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use tracing::info;

use crate::config::{PathFilter, RepairOptions};
use crate::db::consistency::{self, ConsistencyStats};
use crate::db::LocalStateDatabase;
use crate::error::{DarnerError, Result};
use crate::hash::HashAlgorithm;
use crate::progress::RepairControl;
use crate::storage::Backend;
use crate::verification;

pub use fileset::run_repair_broken_filesets;
pub use reconcile::{run_repair_remote, RemoteRepairStats};

/// Interface to the external recreate-from-remote path. The repair engine
/// only invokes it; rebuilding a database from scratch lives elsewhere.
pub trait DatabaseRecreator {
    fn recreate(
        &self,
        backend: &dyn Backend,
        dbpath: &Path,
        options: &RepairOptions,
        filter: &PathFilter,
    ) -> Result<()>;
}

/// One repair invocation: options plus the collaborators the engine consumes.
pub struct RepairRequest<'a> {
    pub options: &'a RepairOptions,
    pub filter: &'a PathFilter,
    pub recreate: Option<&'a dyn DatabaseRecreator>,
    pub progress: Option<&'a mut dyn FnMut(f32)>,
    pub cancel: Option<&'a AtomicBool>,
}

/// Summary of a full repair run.
#[derive(Debug, Default)]
pub struct RepairStats {
    pub consistency: ConsistencyStats,
    pub broken_filesets_repaired: usize,
    pub remote: Option<RemoteRepairStats>,
    /// True when the database was recreated from the remote store instead of
    /// reconciled.
    pub recreated: bool,
}

/// Bound on the `<name>.backup-N` rename probe.
const MAX_BACKUP_SUFFIX: usize = 1000;

/// Run a repair. Decides the top-level strategy once:
/// a missing database is recreated; an empty one is set aside and recreated;
/// a populated one is fixed locally, then reconciled against the remote.
pub fn run(backend: &dyn Backend, request: RepairRequest<'_>) -> Result<RepairStats> {
    let options = request.options;
    if options.allow_passphrase_change {
        return Err(DarnerError::PassphraseChangeUnsupported);
    }
    let algorithm = HashAlgorithm::from_config(&options.block_hash_algorithm)?;

    let mut stats = RepairStats::default();

    if !options.dbpath.exists() {
        // Nothing to reconcile against; delegate to recreate, then fix what
        // that path is known to leave behind.
        recreate_database(backend, request.recreate, options, request.filter)?;
        let mut db = LocalStateDatabase::open(&options.dbpath)?;
        stats.consistency = consistency::run_all(&mut db, algorithm, options.blocksize)?;
        stats.recreated = true;
        finish(&mut db, options)?;
        return Ok(stats);
    }

    let mut db = LocalStateDatabase::open(&options.dbpath)?;

    if db.remote_volume_count() == 0 {
        // An empty database is almost certainly a stale placeholder.
        if options.dry_run {
            info!(
                path = %options.dbpath.display(),
                "would set the empty database aside and recreate it from the remote store"
            );
            return Ok(stats);
        }
        drop(db);
        let backup = rename_database_aside(&options.dbpath)?;
        info!(backup = %backup.display(), "set empty database aside");
        recreate_database(backend, request.recreate, options, request.filter)?;
        let mut db = LocalStateDatabase::open(&options.dbpath)?;
        stats.consistency = consistency::run_all(&mut db, algorithm, options.blocksize)?;
        stats.recreated = true;
        finish(&mut db, options)?;
        return Ok(stats);
    }

    stats.consistency = run_repair_common(&mut db, options)?;
    stats.broken_filesets_repaired = run_repair_broken_filesets(backend, &mut db, options)?;

    let mut control = RepairControl::new(request.progress, request.cancel);
    let remote = run_repair_remote(backend, &mut db, options, &mut control)?;
    let synchronized = remote.synchronized;
    stats.remote = Some(remote);

    if options.upload_verification_file && !options.dry_run {
        verification::upload_verification_file(backend, &db, options)?;
    }
    if synchronized {
        info!("repair finished: nothing to do");
    }
    finish(&mut db, options)?;
    Ok(stats)
}

/// The local-only portion of repair: the idempotent row fixes.
pub fn run_repair_common(
    db: &mut LocalStateDatabase,
    options: &RepairOptions,
) -> Result<ConsistencyStats> {
    let algorithm = HashAlgorithm::from_config(&options.block_hash_algorithm)?;
    let stats = consistency::run_all(db, algorithm, options.blocksize)?;
    if stats.changed_anything() && !options.dry_run {
        db.commit("RepairCommon")?;
    }
    Ok(stats)
}

/// The recreate path, exposed for callers that want it directly.
pub fn run_repair_local(
    backend: &dyn Backend,
    recreate: Option<&dyn DatabaseRecreator>,
    options: &RepairOptions,
    filter: &PathFilter,
) -> Result<()> {
    recreate_database(backend, recreate, options, filter)
}

fn recreate_database(
    backend: &dyn Backend,
    recreate: Option<&dyn DatabaseRecreator>,
    options: &RepairOptions,
    filter: &PathFilter,
) -> Result<()> {
    let handler = recreate.ok_or(DarnerError::DatabaseDoesNotExist)?;
    info!(path = %options.dbpath.display(), "recreating local database from the remote store");
    handler.recreate(backend, &options.dbpath, options, filter)
}

/// Move a stale database file to the first free `<name>.backup[-N]` slot.
fn rename_database_aside(dbpath: &Path) -> Result<std::path::PathBuf> {
    let base = format!("{}.backup", dbpath.display());
    for attempt in 0..MAX_BACKUP_SUFFIX {
        let candidate = if attempt == 0 {
            std::path::PathBuf::from(&base)
        } else {
            std::path::PathBuf::from(format!("{base}-{attempt}"))
        };
        if !candidate.exists() {
            std::fs::rename(dbpath, &candidate)?;
            return Ok(candidate);
        }
    }
    Err(DarnerError::Other(format!(
        "no free backup name for '{}' after {MAX_BACKUP_SUFFIX} attempts",
        dbpath.display()
    )))
}

/// Every branch ends here: stamp the end time and persist. Dry-run leaves
/// the database file bit-identical, so the stamp is skipped there.
fn finish(db: &mut LocalStateDatabase, options: &RepairOptions) -> Result<()> {
    if options.dry_run {
        return Ok(());
    }
    db.write_end_time(Utc::now());
    db.commit("RepairComplete")
}
