//! Single-unit extraction into a scoped scratch area

use crate::error::{PipelineError, Result};
use crate::source::UnitSource;
use crate::unit::WorkUnit;
use archsync_common::checksum::verify_file_checksum;
use archsync_common::CommonError;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};

/// Prefix of per-unit scratch directories; leftovers are swept by preflight
pub const SCRATCH_DIR_PREFIX: &str = ".pipeline_";

/// Name prefix shared by every scratch directory of one run identity
pub fn scratch_prefix(run_identity: &str) -> String {
    format!("{SCRATCH_DIR_PREFIX}{run_identity}_")
}

/// Whether `name` is a scratch directory created for `run_identity`.
///
/// Names are `<prefix><unit key>_<random>`. The key must be a date, so an
/// identity that extends this one (`A` vs `A_x`) never matches.
pub fn is_scratch_dir_of(name: &str, run_identity: &str) -> bool {
    let Some(rest) = name.strip_prefix(&scratch_prefix(run_identity)) else {
        return false;
    };
    let Some((key, random)) = rest.rsplit_once('_') else {
        return false;
    };
    NaiveDate::parse_from_str(key, "%Y-%m-%d").is_ok()
        && !random.is_empty()
        && random.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Scratch directory for one unit, removed when dropped
#[derive(Debug)]
pub struct ScratchArea {
    dir: TempDir,
}

impl ScratchArea {
    pub fn create(root: &Path, run_identity: &str, key: &str) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}{key}_", scratch_prefix(run_identity)))
            .tempdir_in(root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Keep the directory on disk and hand back its path
    pub fn keep(self) -> PathBuf {
        self.dir.into_path()
    }

    /// Remove now, logging rather than failing if that does not work
    pub fn release(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove scratch directory");
        }
    }
}

/// Pulls one unit out of the archive and checks it against the manifest
pub struct Extractor {
    source: Arc<dyn UnitSource>,
    archive: PathBuf,
}

impl Extractor {
    pub fn new(source: Arc<dyn UnitSource>, archive: impl Into<PathBuf>) -> Self {
        Self {
            source,
            archive: archive.into(),
        }
    }

    /// Extract `unit` into the directory `dir`, returning the raw file's path
    pub fn extract(&self, unit: &WorkUnit, dir: &Path) -> Result<PathBuf> {
        let file_name = unit.member.rsplit('/').next().unwrap_or(&unit.member);
        let dest = dir.join(file_name);

        let written = self.source.extract_to(&self.archive, unit, &dest)?;
        if written != unit.expected_size {
            return Err(PipelineError::integrity(
                &unit.member,
                format!("expected {} bytes, extracted {}", unit.expected_size, written),
            ));
        }

        verify_file_checksum(&dest, &unit.expected_sha256).map_err(|e| match e {
            CommonError::ChecksumMismatch {
                expected, actual, ..
            } => PipelineError::integrity(
                &unit.member,
                format!("expected sha256 {expected}, got {actual}"),
            ),
            other => other.into(),
        })?;

        debug!(unit = %unit.key, bytes = written, "Extracted and verified");
        Ok(dest)
    }
}
