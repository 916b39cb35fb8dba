//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod reset;
pub mod run;
pub mod status;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::source::{ArchiveListing, SourceRegistry, UnitSource};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Resolve the configured source and enumerate `archive` with it
pub fn open_archive(
    config: &PipelineConfig,
    archive: &Path,
) -> Result<(Arc<dyn UnitSource>, ArchiveListing)> {
    let registry = SourceRegistry::with_defaults(config);
    let source = registry.get(&config.source_kind)?;
    let listing = source.enumerate(archive)?;

    info!(
        archive = %archive.display(),
        run = %listing.run_identity,
        units = listing.units.len(),
        "Enumerated archive"
    );
    Ok((source, listing))
}
