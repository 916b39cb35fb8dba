//! `archsync reset` command implementation
//!
//! Marks every unit of an archive pending again so the next run reprocesses
//! all of them.

use crate::commands::open_archive;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::state::{RunLock, StateStore};
use colored::Colorize;
use std::path::Path;
use tracing::info;

pub async fn run(config: &PipelineConfig, archive: &Path, yes: bool) -> Result<()> {
    if !yes {
        return Err(PipelineError::Other(anyhow::anyhow!(
            "reset discards all recorded progress; pass --yes to confirm"
        )));
    }

    let (_, listing) = open_archive(config, archive)?;
    let _lock = RunLock::acquire(&config.state_dir, &listing.run_identity)?;

    let path = StateStore::state_path(&config.state_dir, &listing.run_identity);
    if StateStore::read(&path)?.is_none() {
        println!("Nothing to reset for run {}.", listing.run_identity);
        return Ok(());
    }

    let mut store = StateStore::load(&config.state_dir, &listing, archive, &config.storage)?;
    let before = store.state().counts();
    store.reset()?;

    info!(run = %listing.run_identity, done = before.done, failed = before.failed, "State reset");
    println!(
        "{} Reset {} unit(s) for run {} ({} were done)",
        "✓".green(),
        store.state().units.len(),
        listing.run_identity,
        before.done
    );
    Ok(())
}
