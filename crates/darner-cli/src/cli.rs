use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "darner",
    version,
    about = "Repair tooling for darner backup repositories",
    after_help = "\
Environment variables:
  DARNER_LOG    Log filter (overrides -v), e.g. \"debug\" or \"darner_core=trace\""
)]
pub(crate) struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Reconcile the local database with the remote store
    Repair {
        #[command(flatten)]
        common: CommonArgs,

        /// Diagnose only; no remote write, no database mutation
        #[arg(long)]
        dry_run: bool,

        /// Opt in to rebuilding missing Blocks volumes from local files and
        /// surviving remote copies
        #[arg(long)]
        rebuild_missing_block_volumes: bool,

        /// Proceed even when the remote store holds newer filesets than the
        /// local database
        #[arg(long)]
        ignore_outdated_database: bool,

        /// Upload a verification manifest after a successful repair
        #[arg(long)]
        upload_verification_file: bool,

        /// Extra files attached to every rebuilt fileset volume
        #[arg(long)]
        control_file: Vec<String>,
    },

    /// Re-populate filesets that reference unknown blocks
    RepairFilesets {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Classify every remote object against the local database
    ListRemote {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(clap::Args)]
pub(crate) struct CommonArgs {
    /// Path to the remote volume folder
    #[arg(long)]
    pub remote: String,

    /// Path to the local state database
    #[arg(long)]
    pub dbpath: String,

    /// Filename prefix scoping this repository
    #[arg(long, default_value = "darner")]
    pub prefix: String,

    /// Block size in bytes
    #[arg(long, default_value_t = 100 * 1024)]
    pub blocksize: usize,

    /// Block hash algorithm (sha256, blake2b256)
    #[arg(long, default_value = "sha256")]
    pub block_hash_algorithm: String,

    /// Compression module for newly written volumes (zstd, lz4, none)
    #[arg(long, default_value = "zstd")]
    pub compression: String,

    /// Index file policy (none, lookup, full)
    #[arg(long, default_value = "full")]
    pub index_file_policy: String,
}
