//! CLI smoke tests for the `archsync` binary
//!
//! Only paths that need no object store are exercised here.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

/// `archsync` running in `dir` with a clean environment
fn archsync(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("archsync").unwrap();
    cmd.current_dir(dir)
        .env("NO_COLOR", "1")
        .env("AWS_EC2_METADATA_DISABLED", "true")
        .env("AWS_CONFIG_FILE", dir.join("no-aws-config"))
        .env("AWS_SHARED_CREDENTIALS_FILE", dir.join("no-aws-credentials"));
    for var in [
        "S3_BUCKET_NAME",
        "S3_PREFIX",
        "S3_ENDPOINT",
        "S3_ACCESS_KEY",
        "S3_SECRET_KEY",
        "UNDERLYING_SYMBOL",
        "ARCHSYNC_STORAGE__BUCKET",
        "ARCHSYNC_STATE_DIR",
        "LOG_LEVEL",
        "LOG_OUTPUT",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_help_lists_commands() {
    let dir = tempfile::TempDir::new().unwrap();
    archsync(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("reset"));
}

#[test]
fn test_no_arguments_prints_usage() {
    let dir = tempfile::TempDir::new().unwrap();
    archsync(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_missing_archive_is_a_manifest_error() {
    let dir = tempfile::TempDir::new().unwrap();
    archsync(dir.path())
        .args(["run", "missing.zip", "--dry-run"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("ManifestError"));
}

#[test]
fn test_run_without_bucket_is_a_config_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let archive = dir.path().join("data.zip");
    common::write_archive(&archive, &common::DATES, &[]);

    archsync(dir.path())
        .args(["run", "data.zip"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("ConfigError"));
}

#[test]
fn test_dry_run_previews_without_recording_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let archive = dir.path().join("data.zip");
    common::write_archive(&archive, &common::DATES, &[]);

    archsync(dir.path())
        .args(["run", "data.zip", "--dry-run", "--dates", "2025-01-02"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Dry run preview"))
        .stdout(predicate::str::contains("date=2025-01-02/data.parquet"));

    let state_file = dir
        .path()
        .join(".archsync")
        .join(format!("{}.state.json", common::JOB_ID));
    assert!(!state_file.exists());
}

#[test]
fn test_status_without_state() {
    let dir = tempfile::TempDir::new().unwrap();
    common::write_archive(&dir.path().join("data.zip"), &common::DATES, &[]);

    archsync(dir.path())
        .args(["status", "data.zip"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No state recorded"));
}

#[test]
fn test_reset_requires_confirmation() {
    let dir = tempfile::TempDir::new().unwrap();
    common::write_archive(&dir.path().join("data.zip"), &common::DATES, &[]);

    archsync(dir.path())
        .args(["reset", "data.zip"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--yes"));
}
