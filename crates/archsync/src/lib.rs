//! Archsync Library
//!
//! Resumable archive-to-object-storage pipeline.
//!
//! # Overview
//!
//! An archive holds one file per trading date plus a manifest of sizes and
//! checksums. `archsync` processes those units one at a time:
//!
//! - **Enumerate**: list units from the manifest ([`source`])
//! - **Extract**: pull a single unit into scratch space and verify it ([`extract`])
//! - **Convert**: CSV to Parquet ([`convert`])
//! - **Upload**: verified, retrying upload to S3 ([`upload`], [`storage`])
//! - **Record**: crash-safe per-unit state for resume ([`state`])
//!
//! Preflight checks run before any unit work and postflight validation
//! reconciles recorded state with the remote dataset.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod commands;
pub mod config;
pub mod convert;
pub mod error;
pub mod extract;
pub mod orchestrator;
pub mod preflight;
pub mod report;
pub mod shutdown;
pub mod source;
pub mod state;
pub mod storage;
pub mod unit;
pub mod upload;
pub mod validate;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use orchestrator::{Orchestrator, RunOptions, RunOutcome, RunReport};
pub use unit::WorkUnit;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Archsync - resumable archive to S3 Parquet pipeline
#[derive(Parser, Debug)]
#[command(name = "archsync")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to ./archsync.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process every pending unit of an archive
    Run {
        /// Path to the archive
        archive: PathBuf,

        /// Only these dates, comma separated (e.g. 2025-01-01,2025-01-03)
        #[arg(long, value_parser = parse_dates)]
        dates: Option<DateFilter>,

        /// Extract and convert only; nothing is uploaded or recorded
        #[arg(long)]
        dry_run: bool,

        /// Only run postflight validation against the remote dataset
        #[arg(long, conflicts_with_all = ["dry_run", "force"])]
        validate: bool,

        /// Reprocess selected units even when already done
        #[arg(short, long)]
        force: bool,

        /// Keep scratch directories for debugging
        #[arg(long)]
        no_cleanup: bool,
    },

    /// Show recorded state for an archive
    Status {
        /// Path to the archive
        archive: PathBuf,
    },

    /// Forget all recorded progress for an archive
    Reset {
        /// Path to the archive
        archive: PathBuf,

        /// Confirm the reset
        #[arg(short, long)]
        yes: bool,
    },
}

/// Parsed `--dates` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFilter(pub Vec<String>);

fn parse_dates(raw: &str) -> std::result::Result<DateFilter, String> {
    let dates = unit::parse_date_filter(raw)?;
    if dates.is_empty() {
        return Err("no dates given".to_string());
    }
    Ok(DateFilter(dates))
}
