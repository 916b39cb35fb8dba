//! Drives every pending unit through extract, convert, upload and record
//!
//! Run states: `Initializing -> Running -> {Completed | StoppedByRequest |
//! Aborted}`, plus `Terminated` when a second interrupt cuts an in-flight
//! unit short. Units run strictly one at a time. The state store is updated
//! after each unit; unit-level failures are recorded and the run moves on.
//! An unwritable state store or a run-scoped error from unit work aborts.

use crate::config::PipelineConfig;
use crate::convert::{Converter, ARTIFACT_FILE_NAME};
use crate::error::{PipelineError, Result};
use crate::extract::{Extractor, ScratchArea};
use crate::shutdown::ShutdownController;
use crate::source::{ArchiveListing, UnitSource};
use crate::state::{DoneRecord, StateStore, StatusCounts};
use crate::storage::ObjectStore;
use crate::unit::WorkUnit;
use crate::upload::{object_key, UploadReceipt, Uploader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    StoppedByRequest,
    Aborted,
    /// A second interrupt ended the run mid-unit
    Terminated,
}

/// Per-invocation switches
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only these unit keys, when set
    pub dates: Option<Vec<String>>,
    /// Extract and convert only; no upload, no state changes
    pub dry_run: bool,
    /// Reprocess selected units even when done
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub key: String,
    pub summary: String,
}

/// What a dry run would have uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunPreview {
    pub key: String,
    pub location: String,
    pub rows: u64,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub dry_run: bool,
    /// Units completed in this run
    pub processed: Vec<String>,
    pub failed: Vec<UnitFailure>,
    /// Selected units already done before this run
    pub skipped: Vec<String>,
    /// Units not started because the run stopped early
    pub remaining: Vec<String>,
    /// Unit cut short by forced termination
    pub interrupted: Option<String>,
    pub previews: Vec<DryRunPreview>,
    pub abort_reason: Option<String>,
    /// State totals at the end of the run
    pub totals: StatusCounts,
}

impl RunReport {
    fn new(dry_run: bool) -> Self {
        Self {
            outcome: RunOutcome::Completed,
            dry_run,
            processed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            remaining: Vec::new(),
            interrupted: None,
            previews: Vec::new(),
            abort_reason: None,
            totals: StatusCounts::default(),
        }
    }

    /// 0 clean, 1 aborted, 2 unit failures, 3 stopped, 130 terminated
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Completed if self.failed.is_empty() => 0,
            RunOutcome::Completed => 2,
            RunOutcome::StoppedByRequest => 3,
            RunOutcome::Aborted => 1,
            RunOutcome::Terminated => 130,
        }
    }
}

enum UnitResult {
    Uploaded(UploadReceipt),
    Previewed(DryRunPreview),
}

pub struct Orchestrator {
    archive: PathBuf,
    source: Arc<dyn UnitSource>,
    converter: Arc<dyn Converter>,
    store: Arc<dyn ObjectStore>,
    uploader: Uploader,
    shutdown: ShutdownController,
    scratch_root: PathBuf,
    prefix: String,
    underlying: String,
    keep_scratch: bool,
}

impl Orchestrator {
    pub fn new(
        config: &PipelineConfig,
        archive: impl Into<PathBuf>,
        source: Arc<dyn UnitSource>,
        converter: Arc<dyn Converter>,
        store: Arc<dyn ObjectStore>,
        shutdown: ShutdownController,
    ) -> Self {
        let archive = archive.into();
        Self {
            scratch_root: config.scratch_root(&archive),
            uploader: Uploader::new(store.clone(), &config.storage),
            archive,
            source,
            converter,
            store,
            shutdown,
            prefix: config.storage.normalized_prefix(),
            underlying: config.underlying_symbol.clone(),
            keep_scratch: config.keep_scratch,
        }
    }

    pub fn remote_key(&self, unit: &WorkUnit) -> String {
        object_key(&self.prefix, &self.underlying, &unit.key)
    }

    /// Process every selected unit that is not yet done
    pub async fn run(
        &self,
        listing: &ArchiveListing,
        state: &mut StateStore,
        options: &RunOptions,
    ) -> RunReport {
        let mut report = RunReport::new(options.dry_run);

        // Initializing
        let selected = select_units(&listing.units, options.dates.as_deref());
        let pending: Vec<&WorkUnit> = if options.force {
            selected.clone()
        } else {
            state
                .pending_units(&listing.units)
                .into_iter()
                .filter(|u| selected.iter().any(|s| s.key == u.key))
                .collect()
        };
        report.skipped = selected
            .iter()
            .filter(|u| !pending.iter().any(|p| p.key == u.key))
            .map(|u| u.key.clone())
            .collect();

        info!(
            selected = selected.len(),
            pending = pending.len(),
            skipped = report.skipped.len(),
            dry_run = options.dry_run,
            "Starting run"
        );

        // Running
        let total = pending.len();
        for (i, unit) in pending.iter().enumerate() {
            if self.shutdown.is_stop_requested() {
                report.outcome = RunOutcome::StoppedByRequest;
                report.remaining = pending[i..].iter().map(|u| u.key.clone()).collect();
                info!(remaining = report.remaining.len(), "Stop requested, not starting further units");
                break;
            }

            info!("[{}/{}] Processing {}", i + 1, total, unit);

            if !options.dry_run {
                if let Err(e) = state.mark_in_progress(&unit.key, options.force) {
                    abort(&mut report, &e);
                    report.remaining = pending[i..].iter().map(|u| u.key.clone()).collect();
                    break;
                }
            }

            let result = tokio::select! {
                biased;
                _ = self.shutdown.forced() => None,
                r = self.process_unit(&listing.run_identity, unit, options.dry_run) => Some(r),
            };

            let Some(result) = result else {
                warn!(unit = %unit.key, "Terminated while processing; unit left in progress");
                report.outcome = RunOutcome::Terminated;
                report.interrupted = Some(unit.key.clone());
                report.remaining = pending[i + 1..].iter().map(|u| u.key.clone()).collect();
                break;
            };

            let recorded = match result {
                Ok(UnitResult::Uploaded(receipt)) => {
                    let record = DoneRecord {
                        sha256: receipt.sha256,
                        size_bytes: receipt.size,
                        remote_location: receipt.location,
                        etag: receipt.etag,
                    };
                    state
                        .mark_done(&unit.key, record)
                        .map(|()| report.processed.push(unit.key.clone()))
                }
                Ok(UnitResult::Previewed(preview)) => {
                    info!(unit = %unit.key, location = %preview.location, "Dry run: would upload");
                    report.processed.push(unit.key.clone());
                    report.previews.push(preview);
                    Ok(())
                }
                Err(e) => {
                    let summary = e.summary();
                    error!(unit = %unit.key, error = %summary, "Unit failed");
                    report.failed.push(UnitFailure {
                        key: unit.key.clone(),
                        summary: summary.clone(),
                    });
                    let marked = if options.dry_run {
                        Ok(())
                    } else {
                        state.mark_failed(&unit.key, &summary)
                    };
                    // a run-scoped error ends the run even though the unit is recorded
                    match marked {
                        Ok(()) if !e.is_unit_scoped() => Err(e),
                        other => other,
                    }
                }
            };

            if let Err(e) = recorded {
                abort(&mut report, &e);
                report.remaining = pending[i + 1..].iter().map(|u| u.key.clone()).collect();
                break;
            }
        }

        report.totals = state.state().counts();
        info!(
            outcome = ?report.outcome,
            processed = report.processed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            remaining = report.remaining.len(),
            "Run finished"
        );
        report
    }

    /// One unit end to end inside its own scratch area
    async fn process_unit(
        &self,
        run_identity: &str,
        unit: &WorkUnit,
        dry_run: bool,
    ) -> Result<UnitResult> {
        let scratch = ScratchArea::create(&self.scratch_root, run_identity, &unit.key)?;
        let result = self.process_in(unit, scratch.path(), dry_run).await;

        if self.keep_scratch {
            let kept = scratch.keep();
            info!(unit = %unit.key, path = %kept.display(), "Keeping scratch directory");
        } else {
            scratch.release();
        }
        result
    }

    async fn process_in(&self, unit: &WorkUnit, dir: &Path, dry_run: bool) -> Result<UnitResult> {
        let extractor = Extractor::new(self.source.clone(), self.archive.clone());
        let converter = self.converter.clone();
        let owned_unit = unit.clone();
        let work_dir = dir.to_path_buf();
        let keep_raw = self.keep_scratch;

        let (artifact, stats) = tokio::task::spawn_blocking(move || -> Result<_> {
            let raw = extractor.extract(&owned_unit, &work_dir)?;
            let artifact = work_dir.join(ARTIFACT_FILE_NAME);
            let stats = converter.convert(&raw, &artifact)?;
            // free the raw bytes before the upload starts
            if !keep_raw {
                if let Err(e) = std::fs::remove_file(&raw) {
                    warn!(path = %raw.display(), error = %e, "Failed to remove raw file");
                }
            }
            Ok((artifact, stats))
        })
        .await
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("unit task failed: {e}")))??;

        let key = self.remote_key(unit);
        if dry_run {
            let digests = Uploader::digests(&artifact).await?;
            return Ok(UnitResult::Previewed(DryRunPreview {
                key: unit.key.clone(),
                location: self.store.describe(&key),
                rows: stats.rows,
                bytes: digests.size,
                sha256: digests.sha256_hex,
            }));
        }

        let receipt = self.uploader.upload(&artifact, &key).await?;
        Ok(UnitResult::Uploaded(receipt))
    }
}

fn abort(report: &mut RunReport, err: &PipelineError) {
    error!(error = %err, "Aborting run");
    report.outcome = RunOutcome::Aborted;
    report.abort_reason = Some(err.summary());
}

/// Units matching the date filter, in enumeration order
pub fn select_units<'a>(units: &'a [WorkUnit], dates: Option<&[String]>) -> Vec<&'a WorkUnit> {
    match dates {
        None => units.iter().collect(),
        Some(dates) => {
            for date in dates {
                if !units.iter().any(|u| &u.key == date) {
                    warn!(date = %date, "Requested date is not in the archive");
                }
            }
            units.iter().filter(|u| dates.contains(&u.key)).collect()
        }
    }
}
