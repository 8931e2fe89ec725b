use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::db::{LocalStateDatabase, RemoteVolumeRow};
use crate::error::Result;
use crate::storage::Backend;
use crate::volume::name::{parse_any, VolumeName};
use crate::volume::{VolumeKind, VolumeState};

/// A remote object that the database does not account for.
#[derive(Debug, Clone)]
pub struct ExtraVolume {
    pub name: String,
    pub size: i64,
    /// None for names that match no backup grammar at all (stray junk).
    pub parsed: Option<VolumeName>,
}

/// A well-formed remote Files volume with no local fileset behind it.
#[derive(Debug, Clone)]
pub struct UnknownFilesetVolume {
    pub name: String,
    pub parsed: VolumeName,
    pub size: i64,
}

/// Reconciliation of one backend listing against the database.
#[derive(Debug, Default)]
pub struct RemoteListAnalysis {
    /// Names present remotely and known to the database in a durable state.
    pub parsed: Vec<String>,
    /// Remote objects to clean up: junk names, foreign-grammar leftovers with
    /// no prefix of their own, and volumes known only in non-durable states.
    pub extra_volumes: Vec<ExtraVolume>,
    /// Database rows in a durable state with no remote object behind them.
    pub missing_volumes: Vec<RemoteVolumeRow>,
    /// Rows caught mid-upload whose identity must be measured against what
    /// actually landed.
    pub verification_required: Vec<RemoteVolumeRow>,
    /// Remote Files volumes the database has no fileset for.
    pub missing_local_filesets: Vec<UnknownFilesetVolume>,
    /// Database rows whose remote object never materialized; safe to drop.
    pub cleanup_rows: Vec<String>,
    /// Correct-prefix names that match no grammar (left untouched).
    pub other_volumes: Vec<String>,
    /// Prefixes of well-formed names belonging to other repositories.
    pub foreign_prefixes: Vec<String>,
    /// Newest timestamp parsed from any of this repository's remote names.
    pub max_remote_time: Option<DateTime<Utc>>,
}

/// Reconcile the backend listing against the database, classifying every
/// remote name and every database row.
///
/// `exempt_name` is the last incomplete fileset volume: its row survives
/// cleanup so a later normal run can synthesize a filelist there.
pub fn analyze(
    backend: &dyn Backend,
    db: &LocalStateDatabase,
    prefix: &str,
    exempt_name: Option<&str>,
) -> Result<RemoteListAnalysis> {
    let listing = backend.list()?;
    let mut analysis = RemoteListAnalysis::default();
    let mut remote_names: HashSet<&str> = HashSet::new();
    let mut foreign: Vec<String> = Vec::new();

    for entry in &listing {
        if entry.is_folder {
            continue;
        }
        remote_names.insert(entry.name.as_str());

        match parse_any(&entry.name) {
            Some(parsed) if parsed.prefix == prefix => {
                if analysis.max_remote_time.map_or(true, |t| parsed.time > t) {
                    analysis.max_remote_time = Some(parsed.time);
                }
                classify_known_prefix(&mut analysis, db, entry.name.clone(), entry.size, parsed, exempt_name);
            }
            Some(parsed) => {
                // Another repository sharing the folder; never touched.
                if !foreign.contains(&parsed.prefix) {
                    foreign.push(parsed.prefix);
                }
            }
            None if entry.name.starts_with(prefix) => {
                // Ours by prefix but outside the grammar (e.g. the
                // verification manifest); left alone.
                analysis.other_volumes.push(entry.name.clone());
            }
            None => {
                analysis.extra_volumes.push(ExtraVolume {
                    name: entry.name.clone(),
                    size: entry.size,
                    parsed: None,
                });
            }
        }
    }

    // Pass over the database: rows with no remote object behind them.
    for row in db.remote_volumes() {
        if remote_names.contains(row.name.as_str()) {
            continue;
        }
        match row.state {
            VolumeState::Uploaded | VolumeState::Verified => {
                analysis.missing_volumes.push(row.clone());
            }
            VolumeState::Uploading | VolumeState::Temporary | VolumeState::Deleting => {
                if exempt_name == Some(row.name.as_str()) {
                    debug!(name = row.name.as_str(), "leaving last incomplete fileset volume in place");
                } else {
                    analysis.cleanup_rows.push(row.name.clone());
                }
            }
            VolumeState::Deleted => {}
        }
    }

    analysis.foreign_prefixes = foreign;
    debug!(
        parsed = analysis.parsed.len(),
        extras = analysis.extra_volumes.len(),
        missing = analysis.missing_volumes.len(),
        verify = analysis.verification_required.len(),
        unknown_filesets = analysis.missing_local_filesets.len(),
        cleanup = analysis.cleanup_rows.len(),
        "analyzed remote listing"
    );
    Ok(analysis)
}

fn classify_known_prefix(
    analysis: &mut RemoteListAnalysis,
    db: &LocalStateDatabase,
    name: String,
    size: i64,
    parsed: VolumeName,
    exempt_name: Option<&str>,
) {
    match db.get_remote_volume(&name) {
        None => {
            if parsed.kind == VolumeKind::Files {
                analysis.missing_local_filesets.push(UnknownFilesetVolume {
                    name,
                    parsed,
                    size,
                });
            } else {
                analysis.extra_volumes.push(ExtraVolume {
                    name,
                    size,
                    parsed: Some(parsed),
                });
            }
        }
        Some(row) => match row.state {
            VolumeState::Uploading => {
                analysis.verification_required.push(row.clone());
            }
            VolumeState::Uploaded | VolumeState::Verified => {
                analysis.parsed.push(name);
            }
            VolumeState::Temporary | VolumeState::Deleting | VolumeState::Deleted => {
                if exempt_name == Some(name.as_str()) {
                    debug!(name = name.as_str(), "leaving last incomplete fileset volume in place");
                } else {
                    analysis.extra_volumes.push(ExtraVolume {
                        name,
                        size,
                        parsed: Some(parsed),
                    });
                }
            }
        },
    }
}
