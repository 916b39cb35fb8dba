//! `archsync run` command implementation
//!
//! Enumerates the archive, takes the run lock, runs preflight and then every
//! pending unit. With `--validate` only the postflight checks run.

use crate::commands::open_archive;
use crate::config::PipelineConfig;
use crate::convert::{Converter, ParquetConverter};
use crate::error::{PipelineError, Result};
use crate::orchestrator::{Orchestrator, RunOptions, RunReport};
use crate::preflight;
use crate::report::{print_preflight, print_run_report, print_validation};
use crate::shutdown::ShutdownController;
use crate::state::{PipelineState, RunLock, StateStore};
use crate::storage::{ObjectStore, S3Store};
use crate::validate::{ValidationReport, Validator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub archive: PathBuf,
    pub dates: Option<Vec<String>>,
    pub dry_run: bool,
    pub validate: bool,
    pub force: bool,
    pub no_cleanup: bool,
}

/// What a `run` invocation ended with
#[derive(Debug)]
pub enum CommandOutcome {
    Run(RunReport),
    Validated(ValidationReport),
}

impl CommandOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandOutcome::Run(report) => report.exit_code(),
            CommandOutcome::Validated(report) => report.exit_code(),
        }
    }
}

/// Run against S3 with the Parquet converter
pub async fn run(
    config: &PipelineConfig,
    args: &RunArgs,
    shutdown: ShutdownController,
) -> Result<CommandOutcome> {
    if config.storage.bucket.is_empty() && !args.dry_run {
        return Err(PipelineError::config(
            "no destination bucket configured (set S3_BUCKET_NAME or storage.bucket)",
        ));
    }

    let store = S3Store::new(&config.storage).await?;
    execute(
        config,
        args,
        Arc::new(store),
        Arc::new(ParquetConverter::new()),
        shutdown,
    )
    .await
}

/// Run with explicit collaborators
pub async fn execute(
    config: &PipelineConfig,
    args: &RunArgs,
    store: Arc<dyn ObjectStore>,
    converter: Arc<dyn Converter>,
    shutdown: ShutdownController,
) -> Result<CommandOutcome> {
    let mut config = config.clone();
    if args.no_cleanup {
        config.keep_scratch = true;
    }

    let (source, listing) = open_archive(&config, &args.archive)?;

    if args.validate {
        let path = StateStore::state_path(&config.state_dir, &listing.run_identity);
        let state = StateStore::read(&path)?.unwrap_or_else(|| {
            PipelineState::new(
                &listing.run_identity,
                &args.archive,
                &listing.fingerprint,
                &config.storage,
            )
        });
        let report = Validator::new(
            store.as_ref(),
            &config.storage.normalized_prefix(),
            &config.underlying_symbol,
        )
        .validate(&listing.units, &state)
        .await?;
        print_validation(&report);
        return Ok(CommandOutcome::Validated(report));
    }

    let _lock = RunLock::acquire(&config.state_dir, &listing.run_identity)?;

    let checks = preflight::run(&config, &args.archive, &listing, store.as_ref(), args.dry_run).await?;
    print_preflight(&checks);

    let mut state = StateStore::load(&config.state_dir, &listing, &args.archive, &config.storage)?;
    info!(state = %state.path().display(), "State loaded");

    let orchestrator = Orchestrator::new(
        &config,
        args.archive.clone(),
        source,
        converter,
        store,
        shutdown,
    );
    let options = RunOptions {
        dates: args.dates.clone(),
        dry_run: args.dry_run,
        force: args.force,
    };

    let report = orchestrator.run(&listing, &mut state, &options).await;
    print_run_report(&report);
    Ok(CommandOutcome::Run(report))
}
