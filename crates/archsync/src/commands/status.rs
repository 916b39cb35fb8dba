//! `archsync status` command implementation
//!
//! Shows the recorded state of every unit in an archive.

use crate::commands::open_archive;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::report::print_state;
use crate::state::StateStore;
use std::path::Path;

/// Show the state table for `archive`
pub async fn run(config: &PipelineConfig, archive: &Path) -> Result<()> {
    let (_, listing) = open_archive(config, archive)?;
    let path = StateStore::state_path(&config.state_dir, &listing.run_identity);

    match StateStore::read(&path)? {
        Some(state) => print_state(&state),
        None => {
            println!("No state recorded for run {}.", listing.run_identity);
            println!("{} unit(s) in the archive; run 'archsync run' to process them.", listing.units.len());
        }
    }
    Ok(())
}
