use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DarnerError>;

#[derive(Debug, Error)]
pub enum DarnerError {
    #[error("changing the passphrase is not supported during repair")]
    PassphraseChangeUnsupported,

    #[error("database file does not exist: '{0}'")]
    RepairDatabaseFileDoesNotExist(String),

    #[error("the database was only partially recreated; destructive repair is not allowed")]
    DatabaseIsPartiallyRecreated,

    #[error("a previous repair left the database in the repair state; acknowledge before retrying")]
    DatabaseIsInRepairState,

    #[error("the local database has no fileset times to compare against")]
    LocalDatabaseHasNoFilesetTimes,

    #[error(
        "the remote store has files newer ({remote}) than the local database ({local}); \
repairing would delete newer remote data"
    )]
    RemoteFilesNewerThanLocalDatabase {
        remote: DateTime<Utc>,
        local: DateTime<Utc>,
    },

    #[error("no files found with prefix '{prefix}', but the folder is not empty (other prefixes: {others:?})")]
    RemoteFolderEmptyWithPrefix { prefix: String, others: Vec<String> },

    #[error("no remote files are missing; the database should be recreated instead of repaired")]
    NoRemoteFilesMissing,

    #[error("missing Blocks volumes and rebuild was not requested: {0:?}")]
    MissingDblockFiles(Vec<String>),

    #[error("failed to load compression module '{0}'")]
    FailedToLoadCompressionModule(String),

    #[error(
        "repair is not possible: {missing} block(s) could not be recovered from any source; \
affected fileset times: {filesets:?}"
    )]
    RepairIsNotPossible {
        missing: usize,
        filesets: Vec<DateTime<Utc>>,
    },

    #[error("no local database exists and no recreate handler was provided")]
    DatabaseDoesNotExist,

    #[error("operation aborted")]
    Aborted,

    #[error("internal consistency error: {0}")]
    InternalConsistency(String),

    #[error("database is inconsistent: {0}")]
    DatabaseInconsistent(String),

    #[error("remote folder is missing")]
    FolderMissing,

    #[error("remote presented an invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("remote host key mismatch (reported '{reported}', accepted '{accepted}')")]
    HostKey { reported: String, accepted: String },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid volume name: '{0}'")]
    InvalidVolumeName(String),

    #[error("invalid volume format: {0}")]
    InvalidFormat(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("unknown hash algorithm: '{0}'")]
    UnknownHashAlgorithm(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl DarnerError {
    /// Stable identifier for user-facing abort conditions.
    ///
    /// Callers match on these instead of scraping display strings; the ids are
    /// part of the external surface and never change.
    pub fn help_id(&self) -> Option<&'static str> {
        match self {
            DarnerError::PassphraseChangeUnsupported => Some("PassphraseChangeUnsupported"),
            DarnerError::RepairDatabaseFileDoesNotExist(_) => {
                Some("RepairDatabaseFileDoesNotExist")
            }
            DarnerError::DatabaseIsPartiallyRecreated => Some("DatabaseIsPartiallyRecreated"),
            DarnerError::DatabaseIsInRepairState => Some("DatabaseIsInRepairState"),
            DarnerError::LocalDatabaseHasNoFilesetTimes => Some("LocalDatabaseHasNoFilesetTimes"),
            DarnerError::RemoteFilesNewerThanLocalDatabase { .. } => {
                Some("RemoteFilesNewerThanLocalDatabase")
            }
            DarnerError::RemoteFolderEmptyWithPrefix { .. } => Some("RemoteFolderEmptyWithPrefix"),
            DarnerError::NoRemoteFilesMissing => Some("NoRemoteFilesMissing"),
            DarnerError::MissingDblockFiles(_) => Some("MissingDblockFiles"),
            DarnerError::FailedToLoadCompressionModule(_) => {
                Some("FailedToLoadCompressionModule")
            }
            DarnerError::RepairIsNotPossible { .. } => Some("RepairIsNotPossible"),
            DarnerError::DatabaseDoesNotExist => Some("DatabaseDoesNotExist"),
            _ => None,
        }
    }

    /// Whether this error is cancellation-class and must re-propagate through
    /// per-item catch blocks instead of being logged and skipped.
    pub fn is_abort(&self) -> bool {
        matches!(self, DarnerError::Aborted)
    }
}
