//! Environment readiness checks run before any unit work
//!
//! Every check runs even after an earlier one failed, so one invocation
//! reports all problems at once. Remote checks are skipped in a dry run.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::extract::is_scratch_dir_of;
use crate::report::format_bytes;
use crate::source::ArchiveListing;
use crate::state::{is_temp_file_of, StateStore, UnitStatus};
use crate::storage::ObjectStore;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

/// What a previous run left behind for this archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeSummary {
    pub done: usize,
    pub failed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
    pub resume: Option<ResumeSummary>,
    pub removed_scratch: usize,
    pub aborted_uploads: usize,
}

impl PreflightReport {
    pub fn failures(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect()
    }
}

/// Run all checks. The caller must already hold the run lock.
pub async fn run(
    config: &PipelineConfig,
    archive: &Path,
    listing: &ArchiveListing,
    store: &dyn ObjectStore,
    dry_run: bool,
) -> Result<PreflightReport> {
    let mut report = PreflightReport::default();
    let scratch_root = config.scratch_root(archive);

    report.removed_scratch =
        remove_stale_scratch(&scratch_root, &config.state_dir, &listing.run_identity);
    report.checks.push(check_scratch_space(
        &scratch_root,
        listing.largest_unit_bytes(),
        config.scratch_safety_multiple,
    ));

    let state_path = StateStore::state_path(&config.state_dir, &listing.run_identity);
    match StateStore::read(&state_path) {
        Ok(Some(state)) => {
            let keys: Vec<&str> = listing.units.iter().map(|u| u.key.as_str()).collect();
            let count = |status: UnitStatus| {
                keys.iter()
                    .filter(|k| state.status_of(k) == Some(status))
                    .count()
            };
            let summary = ResumeSummary {
                done: count(UnitStatus::Done),
                failed: count(UnitStatus::Failed),
                remaining: keys.len() - count(UnitStatus::Done),
            };
            info!(
                done = summary.done,
                failed = summary.failed,
                remaining = summary.remaining,
                "Resuming previous run"
            );
            report.resume = Some(summary);
            report
                .checks
                .push(CheckResult::pass("state_file", state_path.display().to_string()));
        }
        Ok(None) => report
            .checks
            .push(CheckResult::pass("state_file", "no previous state")),
        Err(e) => report.checks.push(CheckResult::fail("state_file", e.summary())),
    }

    if dry_run {
        debug!("Dry run: skipping remote checks");
    } else {
        report.checks.push(match store.check_credentials().await {
            Ok(()) => CheckResult::pass("credentials", "resolved"),
            Err(e) => CheckResult::fail("credentials", e.to_string()),
        });

        let prefix = config.storage.normalized_prefix();
        report.checks.push(match store.probe(&prefix).await {
            Ok(()) => CheckResult::pass("destination", store.describe(&prefix)),
            Err(e) => CheckResult::fail(
                "destination",
                format!("{} is not writable: {e}", store.describe(&prefix)),
            ),
        });

        let max_age = Duration::from_secs(config.stale_upload_max_age_hours.saturating_mul(3600));
        match store.abort_stale_uploads(&prefix, max_age).await {
            Ok(n) => {
                if n > 0 {
                    info!(aborted = n, "Aborted stale multipart uploads");
                }
                report.aborted_uploads = n;
            }
            Err(e) => warn!(error = %e, "Could not clean up stale multipart uploads"),
        }
    }

    for check in &report.checks {
        if check.passed {
            debug!(check = check.name, detail = %check.detail, "Preflight check passed");
        } else {
            warn!(check = check.name, detail = %check.detail, "Preflight check failed");
        }
    }

    let failures = report.failures();
    if failures.is_empty() {
        Ok(report)
    } else {
        Err(PipelineError::Preflight(failures))
    }
}

fn check_scratch_space(root: &Path, largest: u64, multiple: u64) -> CheckResult {
    let required = largest.saturating_mul(multiple);
    if let Err(e) = std::fs::create_dir_all(root) {
        return CheckResult::fail(
            "scratch_space",
            format!("cannot create {}: {e}", root.display()),
        );
    }
    match fs2::available_space(root) {
        Ok(available) if available >= required => CheckResult::pass(
            "scratch_space",
            format!("{} free, {} needed", format_bytes(available), format_bytes(required)),
        ),
        Ok(available) => CheckResult::fail(
            "scratch_space",
            format!(
                "{} free in {}, need {} ({}x the largest unit)",
                format_bytes(available),
                root.display(),
                format_bytes(required),
                multiple
            ),
        ),
        Err(e) => CheckResult::fail(
            "scratch_space",
            format!("cannot query free space in {}: {e}", root.display()),
        ),
    }
}

/// Delete scratch directories and state temp files left by crashed runs of
/// this identity. Other identities may be running against the same directories.
fn remove_stale_scratch(scratch_root: &Path, state_dir: &Path, run_identity: &str) -> usize {
    let mut removed = 0;

    let targets: [(&Path, fn(&str, &str) -> bool); 2] =
        [(scratch_root, is_scratch_dir_of), (state_dir, is_temp_file_of)];

    for (dir, is_stale) in targets {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_stale(&name, run_identity) {
                continue;
            }
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    info!(path = %path.display(), "Removed leftover from an earlier run");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Could not remove leftover"),
            }
        }
    }
    removed
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::unit::WorkUnit;

    fn listing(sizes: &[u64]) -> ArchiveListing {
        ArchiveListing {
            run_identity: "job-1".to_string(),
            fingerprint: "f".repeat(64),
            units: sizes
                .iter()
                .enumerate()
                .map(|(i, size)| {
                    WorkUnit::new(format!("opra-2025010{}.csv.gz", i + 1), i, *size, "0".repeat(64))
                        .unwrap()
                })
                .collect(),
        }
    }

    fn config_in(dir: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.state_dir = dir.join("state");
        config.scratch_dir = Some(dir.join("scratch"));
        config.storage.bucket = "bucket".to_string();
        config
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_in(dir.path());
        let store = MemoryStore::new("bucket");

        let report = run(&config, Path::new("a.zip"), &listing(&[10, 20]), &store, false)
            .await
            .unwrap();
        assert!(report.checks.iter().all(|c| c.passed));
        assert!(report.resume.is_none());
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_collected() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_in(dir.path());
        let store = MemoryStore::new("bucket");
        store.set_credentials(false);
        store.set_reachable(false);

        let err = run(&config, Path::new("a.zip"), &listing(&[10]), &store, false)
            .await
            .unwrap_err();
        match err {
            PipelineError::Preflight(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("credentials"));
                assert!(failures[1].starts_with("destination"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dry_run_skips_remote_checks() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_in(dir.path());
        let store = MemoryStore::new("bucket");
        store.set_reachable(false);

        let report = run(&config, Path::new("a.zip"), &listing(&[10]), &store, true)
            .await
            .unwrap();
        assert!(report.checks.iter().all(|c| c.name != "destination"));
    }

    #[tokio::test]
    async fn test_insufficient_scratch_space() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_in(dir.path());
        let store = MemoryStore::new("bucket");

        let err = run(&config, Path::new("a.zip"), &listing(&[u64::MAX / 4]), &store, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scratch_space"));
    }

    #[tokio::test]
    async fn test_corrupt_state_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_in(dir.path());
        std::fs::create_dir_all(&config.state_dir).unwrap();
        std::fs::write(StateStore::state_path(&config.state_dir, "job-1"), b"{ not json").unwrap();

        let err = run(&config, Path::new("a.zip"), &listing(&[10]), &MemoryStore::new("b"), true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("state_file"));
    }

    #[tokio::test]
    async fn test_stale_leftovers_are_removed() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_in(dir.path());
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(scratch.join(".pipeline_job-1_2025-01-01_abc123")).unwrap();
        std::fs::create_dir_all(scratch.join("keep-me")).unwrap();
        std::fs::create_dir_all(&config.state_dir).unwrap();
        std::fs::write(config.state_dir.join(".state_job-1_x7Kp2q.tmp"), b"partial").unwrap();

        let report = run(&config, Path::new("a.zip"), &listing(&[10]), &MemoryStore::new("b"), true)
            .await
            .unwrap();
        assert_eq!(report.removed_scratch, 2);
        assert!(scratch.join("keep-me").exists());
        assert!(!scratch.join(".pipeline_job-1_2025-01-01_abc123").exists());
        assert!(!config.state_dir.join(".state_job-1_x7Kp2q.tmp").exists());
    }

    #[tokio::test]
    async fn test_leftovers_of_other_runs_are_untouched() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_in(dir.path());
        let scratch = dir.path().join("scratch");
        let other_scratch = scratch.join(".pipeline_job-2_2025-01-01_inflt1");
        let extended_scratch = scratch.join(".pipeline_job-1_b_2025-01-01_inflt2");
        std::fs::create_dir_all(&other_scratch).unwrap();
        std::fs::create_dir_all(&extended_scratch).unwrap();
        std::fs::create_dir_all(&config.state_dir).unwrap();
        let other_tmp = config.state_dir.join(".state_job-2_A123bc.tmp");
        std::fs::write(&other_tmp, b"partial").unwrap();

        // job-2 is running concurrently under its own lock
        let _other = crate::state::RunLock::acquire(&config.state_dir, "job-2").unwrap();
        let _ours = crate::state::RunLock::acquire(&config.state_dir, "job-1").unwrap();

        let report = run(&config, Path::new("a.zip"), &listing(&[10]), &MemoryStore::new("b"), true)
            .await
            .unwrap();
        assert_eq!(report.removed_scratch, 0);
        assert!(other_scratch.exists());
        assert!(extended_scratch.exists());
        assert!(other_tmp.exists());
    }

    #[tokio::test]
    async fn test_stale_uploads_are_aborted() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_in(dir.path());
        let store = MemoryStore::new("bucket");
        store.set_stale_uploads(2);

        let report = run(&config, Path::new("a.zip"), &listing(&[10]), &store, false)
            .await
            .unwrap();
        assert_eq!(report.aborted_uploads, 2);
    }
}
