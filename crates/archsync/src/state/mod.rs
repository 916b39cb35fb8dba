//! Durable per-unit run state
//!
//! One JSON document per run identity at `<state_dir>/<identity>.state.json`.
//! It is the single source of truth for resume decisions. Every mutation goes
//! through an atomic durable write, so the file on disk always equals either
//! the state before a write or the state after it.

pub mod lock;

use crate::error::{PipelineError, Result};
use crate::source::ArchiveListing;
use crate::storage::config::StorageConfig;
use crate::unit::WorkUnit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub use lock::RunLock;

/// Highest state layout this build understands
pub const STATE_SCHEMA_VERSION: u32 = 1;

pub const STATE_FILE_SUFFIX: &str = ".state.json";

/// Prefix of temporary files written next to the state file
pub const STATE_TEMP_PREFIX: &str = ".state_";
pub const STATE_TEMP_SUFFIX: &str = ".tmp";

/// Name prefix of the temp files one run identity writes
pub fn temp_prefix(run_identity: &str) -> String {
    format!("{STATE_TEMP_PREFIX}{run_identity}_")
}

/// Whether `name` is a state temp file written for `run_identity`
pub fn is_temp_file_of(name: &str, run_identity: &str) -> bool {
    name.strip_prefix(&temp_prefix(run_identity))
        .and_then(|rest| rest.strip_suffix(STATE_TEMP_SUFFIX))
        .is_some_and(|random| !random.is_empty() && random.chars().all(|c| c.is_ascii_alphanumeric()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl UnitStatus {
    /// Allowed status changes. `in_progress -> in_progress` covers a unit
    /// left behind by a crash; `done -> in_progress` needs an explicit force.
    pub fn can_transition_to(self, next: UnitStatus, force: bool) -> bool {
        use UnitStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (Failed, InProgress)
        ) || (force && self == Done && next == InProgress)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitStatus::Pending => "pending",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Done => "done",
            UnitStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Record for one work unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitState {
    pub status: UnitStatus,
    pub member: String,
    #[serde(default)]
    pub attempts: u32,
    /// SHA-256 of the uploaded artifact
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub remote_location: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl UnitState {
    pub fn pending(member: impl Into<String>) -> Self {
        Self {
            status: UnitStatus::Pending,
            member: member.into(),
            attempts: 0,
            sha256: None,
            size_bytes: None,
            remote_location: None,
            etag: None,
            last_error: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
        }
    }
}

/// What gets recorded when a unit completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoneRecord {
    pub sha256: String,
    pub size_bytes: u64,
    pub remote_location: String,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed
    }
}

/// Run-level state plus the per-unit map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub schema_version: u32,
    pub run_identity: String,
    pub archive_path: String,
    pub archive_fingerprint: String,
    pub bucket: String,
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub units: BTreeMap<String, UnitState>,
}

impl PipelineState {
    pub fn new(
        run_identity: impl Into<String>,
        archive_path: &Path,
        archive_fingerprint: impl Into<String>,
        storage: &StorageConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            run_identity: run_identity.into(),
            archive_path: archive_path.display().to_string(),
            archive_fingerprint: archive_fingerprint.into(),
            bucket: storage.bucket.clone(),
            prefix: storage.normalized_prefix(),
            created_at: now,
            last_updated: now,
            units: BTreeMap::new(),
        }
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for unit in self.units.values() {
            match unit.status {
                UnitStatus::Pending => counts.pending += 1,
                UnitStatus::InProgress => counts.in_progress += 1,
                UnitStatus::Done => counts.done += 1,
                UnitStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn status_of(&self, key: &str) -> Option<UnitStatus> {
        self.units.get(key).map(|u| u.status)
    }

    /// Keys of units recorded as done, in key order
    pub fn done_keys(&self) -> impl Iterator<Item = &str> {
        self.units
            .iter()
            .filter(|(_, u)| u.status == UnitStatus::Done)
            .map(|(k, _)| k.as_str())
    }

    /// Parse a state document, rejecting layouts newer than this build
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let state: PipelineState = serde_json::from_slice(bytes)
            .map_err(|e| PipelineError::state(format!("state file is not valid: {e}")))?;
        if state.schema_version > STATE_SCHEMA_VERSION {
            return Err(PipelineError::state(format!(
                "state schema version {} is newer than supported version {}",
                state.schema_version, STATE_SCHEMA_VERSION
            )));
        }
        Ok(state)
    }
}

/// Owner of the state file
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: PipelineState,
}

impl StateStore {
    pub fn state_path(state_dir: &Path, run_identity: &str) -> PathBuf {
        state_dir.join(format!("{run_identity}{STATE_FILE_SUFFIX}"))
    }

    /// Read an existing state file without creating anything
    pub fn read(path: &Path) -> Result<Option<PipelineState>> {
        match std::fs::read(path) {
            Ok(bytes) => PipelineState::from_json(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::state(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Load the state for an archive, or start an empty one in memory.
    ///
    /// Units enumerated now but absent from the file are merged in as pending.
    /// Nothing is written until the first mutation.
    pub fn load(
        state_dir: &Path,
        listing: &ArchiveListing,
        archive: &Path,
        storage: &StorageConfig,
    ) -> Result<Self> {
        let path = Self::state_path(state_dir, &listing.run_identity);

        let mut state = match Self::read(&path)? {
            Some(existing) => {
                debug!(path = %path.display(), units = existing.units.len(), "Loaded state");
                existing
            }
            None => {
                info!(path = %path.display(), "No previous state, starting fresh");
                PipelineState::new(&listing.run_identity, archive, &listing.fingerprint, storage)
            }
        };

        if state.archive_fingerprint != listing.fingerprint {
            warn!(
                previous = %state.archive_fingerprint,
                current = %listing.fingerprint,
                "Archive manifest changed since the last run; merging state"
            );
            state.archive_fingerprint = listing.fingerprint.clone();
        }

        let prefix = storage.normalized_prefix();
        if state.bucket != storage.bucket || state.prefix != prefix {
            warn!(
                previous = %format!("{}/{}", state.bucket, state.prefix),
                current = %format!("{}/{}", storage.bucket, prefix),
                "Destination changed since the last run"
            );
            state.bucket = storage.bucket.clone();
            state.prefix = prefix;
        }

        state.archive_path = archive.display().to_string();

        for unit in &listing.units {
            state
                .units
                .entry(unit.key.clone())
                .or_insert_with(|| UnitState::pending(&unit.member));
        }

        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Units whose status is not done, in enumeration order
    pub fn pending_units<'a>(&self, all: &'a [WorkUnit]) -> Vec<&'a WorkUnit> {
        all.iter()
            .filter(|u| self.state.status_of(&u.key) != Some(UnitStatus::Done))
            .collect()
    }

    pub fn mark_in_progress(&mut self, key: &str, force: bool) -> Result<()> {
        self.update(key, UnitStatus::InProgress, force, |unit, now| {
            unit.attempts += 1;
            unit.started_at = Some(now);
            unit.completed_at = None;
        })
    }

    pub fn mark_done(&mut self, key: &str, record: DoneRecord) -> Result<()> {
        self.update(key, UnitStatus::Done, false, move |unit, now| {
            unit.sha256 = Some(record.sha256);
            unit.size_bytes = Some(record.size_bytes);
            unit.remote_location = Some(record.remote_location);
            unit.etag = record.etag;
            unit.last_error = None;
            unit.completed_at = Some(now);
            unit.failed_at = None;
        })
    }

    pub fn mark_failed(&mut self, key: &str, error_summary: &str) -> Result<()> {
        let summary = error_summary.to_string();
        self.update(key, UnitStatus::Failed, false, move |unit, now| {
            unit.last_error = Some(summary);
            unit.failed_at = Some(now);
        })
    }

    /// Replace the state with an empty one for the same units
    pub fn reset(&mut self) -> Result<()> {
        let mut next = self.state.clone();
        for unit in next.units.values_mut() {
            *unit = UnitState::pending(unit.member.clone());
        }
        next.last_updated = Utc::now();
        self.commit(next)
    }

    fn update<F>(&mut self, key: &str, to: UnitStatus, force: bool, apply: F) -> Result<()>
    where
        F: FnOnce(&mut UnitState, DateTime<Utc>),
    {
        let mut next = self.state.clone();
        let unit = next
            .units
            .get_mut(key)
            .ok_or_else(|| PipelineError::state(format!("unknown unit '{key}'")))?;

        if !unit.status.can_transition_to(to, force) {
            return Err(PipelineError::state(format!(
                "unit '{key}' cannot move from {} to {to}",
                unit.status
            )));
        }

        let now = Utc::now();
        unit.status = to;
        apply(unit, now);
        next.last_updated = now;

        self.commit(next)
    }

    /// Persist `next`, adopting it in memory only once it is durable
    fn commit(&mut self, next: PipelineState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&next)?;
        write_atomic(&self.path, &temp_prefix(&next.run_identity), &bytes)?;
        self.state = next;
        Ok(())
    }
}

/// Write-to-temp, flush, rename, then sync the directory entry
pub fn write_atomic(path: &Path, temp_prefix: &str, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .map_err(|e| PipelineError::state(format!("cannot create {}: {e}", dir.display())))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(temp_prefix)
        .suffix(STATE_TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| PipelineError::state(format!("cannot create temp file: {e}")))?;

    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PipelineError::state(format!("cannot write state: {e}")))?;

    tmp.persist(path)
        .map_err(|e| PipelineError::state(format!("cannot replace {}: {}", path.display(), e.error)))?;

    #[cfg(unix)]
    {
        std::fs::File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| PipelineError::state(format!("cannot sync {}: {e}", dir.display())))?;
    }

    Ok(())
}
