mod cli;
mod signal;

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use darner_core::config::{IndexFilePolicy, PathFilter, RepairOptions};
use darner_core::error::Result;
use darner_core::repair::{self, analyzer, RepairRequest};
use darner_core::storage::local_backend::LocalBackend;
use darner_core::storage::Backend;

use cli::{Cli, CommonArgs, Commands};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    signal::install_signal_handlers();

    match dispatch(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.help_id() {
                Some(id) => error!("{e} [{id}]"),
                None => error!("{e}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("DARNER_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_options(common: &CommonArgs) -> Result<RepairOptions> {
    let mut options = RepairOptions::new(&common.dbpath);
    options.prefix = common.prefix.clone();
    options.blocksize = common.blocksize;
    options.block_hash_algorithm = common.block_hash_algorithm.clone();
    options.compression_module = common.compression.clone();
    options.index_file_policy = IndexFilePolicy::from_config(&common.index_file_policy)?;
    Ok(options)
}

fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Repair {
            common,
            dry_run,
            rebuild_missing_block_volumes,
            ignore_outdated_database,
            upload_verification_file,
            control_file,
        } => {
            let mut options = build_options(&common)?;
            options.dry_run = dry_run;
            options.rebuild_missing_block_volumes = rebuild_missing_block_volumes;
            options.repair_ignore_outdated_database = ignore_outdated_database;
            options.upload_verification_file = upload_verification_file;
            options.control_files = control_file.iter().map(Into::into).collect();

            let backend = LocalBackend::new(&common.remote);
            backend.test()?;

            let mut progress = |fraction: f32| {
                tracing::info!("repair progress: {:.0}%", fraction * 100.0);
            };
            let stats = repair::run(
                &backend,
                RepairRequest {
                    options: &options,
                    filter: &PathFilter::empty(),
                    recreate: None,
                    progress: Some(&mut progress),
                    cancel: Some(&signal::SHUTDOWN),
                },
            )?;

            if let Some(remote) = &stats.remote {
                if remote.synchronized {
                    println!("Repository is synchronized; nothing to do.");
                } else {
                    println!(
                        "Repair finished: {} verified, {} adopted, {} extras deleted, \
{} filesets reuploaded, {} filesets recreated, {} volumes rebuilt, {} empty indexes deleted",
                        remote.volumes_verified,
                        remote.indexes_adopted,
                        remote.extras_deleted,
                        remote.filesets_reuploaded,
                        remote.filesets_recreated,
                        remote.volumes_reuploaded,
                        remote.empty_indexes_deleted,
                    );
                }
            }
            if stats.broken_filesets_repaired > 0 {
                println!("Repaired {} broken fileset(s).", stats.broken_filesets_repaired);
            }
            Ok(())
        }

        Commands::RepairFilesets { common } => {
            let options = build_options(&common)?;
            let backend = LocalBackend::new(&common.remote);
            backend.test()?;
            let mut db = darner_core::db::LocalStateDatabase::open(&options.dbpath)?;
            let repaired = repair::run_repair_broken_filesets(&backend, &mut db, &options)?;
            println!("Repaired {repaired} broken fileset(s).");
            Ok(())
        }

        Commands::ListRemote { common } => {
            let options = build_options(&common)?;
            let backend = LocalBackend::new(&common.remote);
            backend.test()?;
            let db = darner_core::db::LocalStateDatabase::open(&options.dbpath)?;
            let exempt = db.get_last_incomplete_fileset_volume();
            let analysis = analyzer::analyze(&backend, &db, &options.prefix, exempt.as_deref())?;

            println!("{:<24} {}", "known and present:", analysis.parsed.len());
            println!("{:<24} {}", "extra:", analysis.extra_volumes.len());
            println!("{:<24} {}", "missing:", analysis.missing_volumes.len());
            println!(
                "{:<24} {}",
                "needs verification:",
                analysis.verification_required.len()
            );
            println!(
                "{:<24} {}",
                "filesets to recreate:",
                analysis.missing_local_filesets.len()
            );
            println!("{:<24} {}", "dangling rows:", analysis.cleanup_rows.len());
            for extra in &analysis.extra_volumes {
                println!("  extra: {} ({} bytes)", extra.name, extra.size);
            }
            for missing in &analysis.missing_volumes {
                println!("  missing: {} ({:?})", missing.name, missing.kind);
            }
            if !analysis.foreign_prefixes.is_empty() {
                println!("other prefixes sharing the folder: {:?}", analysis.foreign_prefixes);
            }
            Ok(())
        }
    }
}
