//! Postflight reconciliation of recorded state against remote contents
//!
//! Findings are collected into a [`ValidationReport`]; nothing here fails the
//! process except being unable to talk to the store at all.

use crate::convert::ARTIFACT_FILE_NAME;
use crate::error::{PipelineError, Result};
use crate::state::{PipelineState, UnitStatus};
use crate::storage::{ObjectMeta, ObjectStore, StoreError};
use crate::unit::WorkUnit;
use crate::upload::{date_from_key, object_key};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{info, instrument, warn};

const PARQUET_MAGIC: &[u8] = b"PAR1";

/// One discrepancy between the expected and the actual remote dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub check: &'static str,
    pub key: String,
    pub detail: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.check, self.key, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub passed: bool,
    pub summary: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub checks: Vec<CheckOutcome>,
    pub errors: Vec<ValidationError>,
    pub remote_objects: usize,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// 0 when every check passed, 2 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            2
        }
    }

    fn record(&mut self, name: &'static str, errors: Vec<ValidationError>, ok_summary: String) {
        let passed = errors.is_empty();
        let summary = if passed {
            ok_summary
        } else {
            format!("{} problem(s)", errors.len())
        };
        if passed {
            info!(check = name, "{}", summary);
        } else {
            for e in &errors {
                warn!(check = name, key = %e.key, "{}", e.detail);
            }
        }
        self.checks.push(CheckOutcome {
            name,
            passed,
            summary,
        });
        self.errors.extend(errors);
    }
}

fn store_failure(what: &str, err: StoreError) -> PipelineError {
    PipelineError::Other(anyhow::anyhow!("postflight {what} failed: {err}"))
}

pub struct Validator<'a> {
    store: &'a dyn ObjectStore,
    prefix: String,
    underlying: String,
}

impl<'a> Validator<'a> {
    pub fn new(store: &'a dyn ObjectStore, prefix: &str, underlying: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            underlying: underlying.to_string(),
        }
    }

    fn data_prefix(&self) -> String {
        format!("{}/underlying={}/", self.prefix, self.underlying)
    }

    /// Cross-check `units` and `state` against the objects under the prefix
    #[instrument(skip_all, fields(prefix = %self.prefix))]
    pub async fn validate(
        &self,
        units: &[WorkUnit],
        state: &PipelineState,
    ) -> Result<ValidationReport> {
        let listed = self
            .store
            .list(&self.data_prefix())
            .await
            .map_err(|e| store_failure("listing", e))?;

        // date -> object, data objects only
        let remote: BTreeMap<String, ObjectMeta> = listed
            .into_iter()
            .filter(|m| m.key.ends_with(&format!("/{ARTIFACT_FILE_NAME}")))
            .filter_map(|m| date_from_key(&m.key).map(|d| (d.to_string(), m.clone())))
            .collect();
        let expected: BTreeSet<&str> = units.iter().map(|u| u.key.as_str()).collect();

        let mut report = ValidationReport {
            remote_objects: remote.len(),
            ..ValidationReport::default()
        };

        let count_errors = if remote.len() == units.len() {
            Vec::new()
        } else {
            vec![ValidationError {
                check: "remote_object_count",
                key: self.data_prefix(),
                detail: format!("{} data objects for {} units", remote.len(), units.len()),
            }]
        };
        report.record(
            "remote_object_count",
            count_errors,
            format!("{} data objects", remote.len()),
        );

        let consistency = self.check_done_units(state, &remote).await?;
        let done = state.units.values().filter(|u| u.status == UnitStatus::Done).count();
        report.record(
            "state_remote_consistency",
            consistency,
            format!("{done} done unit(s) match"),
        );

        let missing_dates = units
            .iter()
            .filter(|u| !remote.contains_key(&u.key))
            .map(|u| ValidationError {
                check: "date_completeness",
                key: u.key.clone(),
                detail: "no remote object for this date".to_string(),
            })
            .collect();
        report.record(
            "date_completeness",
            missing_dates,
            format!("all {} dates present", units.len()),
        );

        let empty = remote
            .values()
            .filter(|m| m.size == 0)
            .map(|m| ValidationError {
                check: "no_zero_byte_objects",
                key: m.key.clone(),
                detail: "object is empty".to_string(),
            })
            .collect();
        report.record("no_zero_byte_objects", empty, "no empty objects".to_string());

        let sample = spot_check_sample(&remote);
        let mut spot = Vec::new();
        for meta in &sample {
            if let Some(problem) = self.check_parquet_magic(meta).await? {
                spot.push(ValidationError {
                    check: "parquet_spot_check",
                    key: meta.key.clone(),
                    detail: problem,
                });
            }
        }
        report.record(
            "parquet_spot_check",
            spot,
            format!("{} sampled object(s) are parquet", sample.len()),
        );

        let orphans = remote
            .iter()
            .filter(|(date, _)| !expected.contains(date.as_str()))
            .map(|(_, m)| ValidationError {
                check: "orphan_objects",
                key: m.key.clone(),
                detail: "date is not in the archive".to_string(),
            })
            .collect();
        report.record("orphan_objects", orphans, "no orphans".to_string());

        Ok(report)
    }

    /// Every done unit must have a remote object of the recorded size and checksum
    async fn check_done_units(
        &self,
        state: &PipelineState,
        remote: &BTreeMap<String, ObjectMeta>,
    ) -> Result<Vec<ValidationError>> {
        let mut errors = Vec::new();

        for (date, unit) in state.units.iter().filter(|(_, u)| u.status == UnitStatus::Done) {
            let key = object_key(&self.prefix, &self.underlying, date);
            let problem = |detail: String| ValidationError {
                check: "state_remote_consistency",
                key: key.clone(),
                detail,
            };

            if !remote.contains_key(date) {
                errors.push(problem("recorded done but missing remotely".to_string()));
                continue;
            }

            let Some(meta) = self
                .store
                .head(&key)
                .await
                .map_err(|e| store_failure("head", e))?
            else {
                errors.push(problem("recorded done but missing remotely".to_string()));
                continue;
            };

            if let Some(expected) = unit.size_bytes {
                if meta.size != expected {
                    errors.push(problem(format!(
                        "size {} differs from recorded {}",
                        meta.size, expected
                    )));
                    continue;
                }
            }

            match (unit.sha256.as_deref(), meta.sha256.as_deref()) {
                (Some(recorded), Some(actual)) if !recorded.eq_ignore_ascii_case(actual) => {
                    errors.push(problem(format!(
                        "sha256 {actual} differs from recorded {recorded}"
                    )));
                    continue;
                }
                (Some(_), None) => {
                    errors.push(problem("remote object has no sha256 metadata".to_string()));
                    continue;
                }
                _ => {}
            }

            // sha256 metadata is only what the writer claimed; the etag follows the bytes
            if let (Some(recorded), Some(actual)) = (unit.etag.as_deref(), meta.etag.as_deref()) {
                if normalize_etag(recorded) != normalize_etag(actual) {
                    errors.push(problem(format!(
                        "etag {actual} differs from recorded {recorded}; content changed"
                    )));
                }
            }
        }

        Ok(errors)
    }

    async fn check_parquet_magic(&self, meta: &ObjectMeta) -> Result<Option<String>> {
        let magic_len = PARQUET_MAGIC.len() as u64;
        if meta.size < magic_len * 2 {
            return Ok(Some(format!("only {} bytes", meta.size)));
        }

        let head = self
            .store
            .read_range(&meta.key, 0, magic_len)
            .await
            .map_err(|e| store_failure("read", e))?;
        let tail = self
            .store
            .read_range(&meta.key, meta.size - magic_len, magic_len)
            .await
            .map_err(|e| store_failure("read", e))?;

        if head != PARQUET_MAGIC || tail != PARQUET_MAGIC {
            return Ok(Some("missing PAR1 magic".to_string()));
        }
        Ok(None)
    }
}

fn normalize_etag(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// First, middle and last object by key; fewer when there are fewer objects
fn spot_check_sample(remote: &BTreeMap<String, ObjectMeta>) -> Vec<&ObjectMeta> {
    let all: Vec<&ObjectMeta> = remote.values().collect();
    let mut picks: Vec<usize> = match all.len() {
        0 => Vec::new(),
        n => vec![0, n / 2, n - 1],
    };
    picks.dedup();
    picks.into_iter().map(|i| all[i]).collect()
}
