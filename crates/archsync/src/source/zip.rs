//! ZIP archives with an embedded `manifest.json`
//!
//! ```json
//! {"job_id": "OPRA-20250807-XYZ",
//!  "files": [{"filename": "opra-20250807.cbbo-1m.csv.gz", "size": 1234, "hash": "sha256:..."}]}
//! ```
//!
//! Only manifest entries ending in the configured member suffix are units;
//! everything else listed (metadata, symbology, condition files) is ignored.

use super::{ArchiveListing, UnitSource};
use crate::error::{PipelineError, Result};
use crate::unit::WorkUnit;
use ::zip::ZipArchive;
use archsync_common::checksum::{compute_checksum, is_sha256_hex};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use tracing::debug;

pub const MANIFEST_NAME: &str = "manifest.json";

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    job_id: Option<String>,
    files: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    filename: String,
    size: u64,
    hash: String,
}

/// Source provider for ZIP archives
#[derive(Debug, Clone)]
pub struct ZipSource {
    member_suffix: String,
}

impl ZipSource {
    pub fn new(member_suffix: impl Into<String>) -> Self {
        Self {
            member_suffix: member_suffix.into(),
        }
    }

    fn open(archive: &Path) -> Result<ZipArchive<BufReader<File>>> {
        let file = File::open(archive).map_err(|e| {
            PipelineError::manifest(format!("cannot open archive {}: {e}", archive.display()))
        })?;
        ZipArchive::new(BufReader::new(file)).map_err(|e| {
            PipelineError::manifest(format!("{} is not a readable zip: {e}", archive.display()))
        })
    }
}

impl UnitSource for ZipSource {
    fn id(&self) -> &'static str {
        "zip"
    }

    fn enumerate(&self, archive_path: &Path) -> Result<ArchiveListing> {
        let mut archive = Self::open(archive_path)?;

        let manifest_bytes = {
            let mut entry = archive.by_name(MANIFEST_NAME).map_err(|_| {
                PipelineError::manifest(format!(
                    "{MANIFEST_NAME} not found in {}",
                    archive_path.display()
                ))
            })?;
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| PipelineError::manifest(format!("cannot read {MANIFEST_NAME}: {e}")))?;
            buf
        };
        let fingerprint = compute_checksum(&manifest_bytes);
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| PipelineError::manifest(format!("{MANIFEST_NAME} is not valid: {e}")))?;

        // name -> (index, uncompressed size) for every file entry
        let mut members: HashMap<String, (usize, u64)> = HashMap::new();
        for index in 0..archive.len() {
            let entry = archive
                .by_index_raw(index)
                .map_err(|e| PipelineError::manifest(format!("unreadable entry #{index}: {e}")))?;
            if !entry.is_dir() {
                members.insert(entry.name().to_string(), (index, entry.size()));
            }
        }

        let mut units = Vec::new();
        let mut listed = BTreeSet::new();
        let mut seen_keys: HashMap<String, String> = HashMap::new();

        for entry in manifest
            .files
            .iter()
            .filter(|e| e.filename.ends_with(&self.member_suffix))
        {
            listed.insert(entry.filename.as_str());

            let (index, actual_size) = members.get(&entry.filename).copied().ok_or_else(|| {
                PipelineError::manifest(format!(
                    "'{}' is listed in the manifest but missing from the archive",
                    entry.filename
                ))
            })?;

            if actual_size != entry.size {
                return Err(PipelineError::manifest(format!(
                    "'{}' declared size {} but archive entry is {} bytes",
                    entry.filename, entry.size, actual_size
                )));
            }

            let digest = entry
                .hash
                .strip_prefix("sha256:")
                .filter(|h| is_sha256_hex(h))
                .ok_or_else(|| {
                    PipelineError::manifest(format!(
                        "'{}' has hash '{}', expected sha256:<64 hex chars>",
                        entry.filename, entry.hash
                    ))
                })?;

            let unit = WorkUnit::new(&entry.filename, index, entry.size, digest).ok_or_else(|| {
                PipelineError::manifest(format!(
                    "'{}' has no YYYYMMDD date in its name",
                    entry.filename
                ))
            })?;

            if let Some(other) = seen_keys.insert(unit.key.clone(), entry.filename.clone()) {
                return Err(PipelineError::manifest(format!(
                    "'{}' and '{}' both map to date {}",
                    other, entry.filename, unit.key
                )));
            }

            units.push(unit);
        }

        let mut unlisted: Vec<&str> = members
            .keys()
            .map(String::as_str)
            .filter(|name| name.ends_with(&self.member_suffix) && !listed.contains(name))
            .collect();
        if !unlisted.is_empty() {
            unlisted.sort_unstable();
            return Err(PipelineError::manifest(format!(
                "archive holds {} data file(s) not listed in the manifest: {}",
                unlisted.len(),
                unlisted.join(", ")
            )));
        }

        if units.is_empty() {
            return Err(PipelineError::manifest(format!(
                "manifest lists no '*{}' data files",
                self.member_suffix
            )));
        }

        units.sort_by(|a, b| a.date.cmp(&b.date));

        let run_identity = run_identity(manifest.job_id.as_deref(), archive_path);
        debug!(
            identity = %run_identity,
            units = units.len(),
            "Enumerated archive"
        );

        Ok(ArchiveListing {
            run_identity,
            fingerprint,
            units,
        })
    }

    fn extract_to(&self, archive_path: &Path, unit: &WorkUnit, dest: &Path) -> Result<u64> {
        let mut archive = Self::open(archive_path)
            .map_err(|e| PipelineError::integrity(&unit.member, e.to_string()))?;
        let mut entry = archive
            .by_index(unit.index)
            .map_err(|e| PipelineError::integrity(&unit.member, format!("cannot open entry: {e}")))?;

        if entry.name() != unit.member {
            return Err(PipelineError::integrity(
                &unit.member,
                format!("archive entry #{} is now '{}'", unit.index, entry.name()),
            ));
        }

        let mut out = File::create(dest)?;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let n = entry
                .read(&mut buffer)
                .map_err(|e| PipelineError::integrity(&unit.member, format!("read failed: {e}")))?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])?;
            written += n as u64;
        }
        out.sync_all()?;

        Ok(written)
    }
}

/// Manifest `job_id`, else the archive's file stem, restricted to `[A-Za-z0-9._-]`
pub fn run_identity(job_id: Option<&str>, archive: &Path) -> String {
    let raw = job_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            archive
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "archive".to_string())
        });

    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ::zip::write::SimpleFileOptions;
    use ::zip::ZipWriter;
    use tempfile::TempDir;

    fn sha(data: &[u8]) -> String {
        format!("sha256:{}", compute_checksum(data))
    }

    /// Write an archive holding `files` and, optionally, a manifest
    fn write_zip(dir: &Path, manifest: Option<String>, files: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.join("job.zip");
        let mut writer = ZipWriter::new(File::create(&path).unwrap());
        if let Some(m) = manifest {
            writer.start_file(MANIFEST_NAME, SimpleFileOptions::default()).unwrap();
            writer.write_all(m.as_bytes()).unwrap();
        }
        for (name, data) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn manifest_for(job_id: &str, files: &[(&str, &[u8])]) -> String {
        let entries: Vec<serde_json::Value> = files
            .iter()
            .map(|(name, data)| {
                serde_json::json!({"filename": name, "size": data.len(), "hash": sha(data)})
            })
            .collect();
        serde_json::json!({"job_id": job_id, "files": entries}).to_string()
    }

    #[test]
    fn test_enumerate_sorted_by_date() {
        let dir = TempDir::new().unwrap();
        let files: &[(&str, &[u8])] = &[
            ("opra-20250103.csv.gz", b"three"),
            ("opra-20250101.csv.gz", b"one"),
            ("metadata.json", b"{}"),
            ("opra-20250102.csv.gz", b"two"),
        ];
        let archive = write_zip(dir.path(), Some(manifest_for("JOB-1", files)), files);

        let listing = ZipSource::new(".csv.gz").enumerate(&archive).unwrap();
        let keys: Vec<_> = listing.units.iter().map(|u| u.key.as_str()).collect();
        assert_eq!(keys, vec!["2025-01-01", "2025-01-02", "2025-01-03"]);
        assert_eq!(listing.run_identity, "JOB-1");
        assert_eq!(listing.largest_unit_bytes(), 5);
        assert_eq!(listing.units[0].expected_sha256, compute_checksum(b"one"));
    }

    #[test]
    fn test_enumerate_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let files: &[(&str, &[u8])] = &[("a-20250101.csv.gz", b"x"), ("a-20250102.csv.gz", b"y")];
        let archive = write_zip(dir.path(), Some(manifest_for("J", files)), files);

        let source = ZipSource::new(".csv.gz");
        let first = source.enumerate(&archive).unwrap();
        let second = source.enumerate(&archive).unwrap();
        assert_eq!(first.units, second.units);
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let archive = write_zip(dir.path(), None, &[("a-20250101.csv.gz", b"x")]);
        let err = ZipSource::new(".csv.gz").enumerate(&archive).unwrap_err();
        assert!(matches!(err, PipelineError::Manifest(ref m) if m.contains("not found")));
    }

    #[test]
    fn test_invalid_manifest_json() {
        let dir = TempDir::new().unwrap();
        let archive = write_zip(dir.path(), Some("{not json".into()), &[]);
        assert!(matches!(
            ZipSource::new(".csv.gz").enumerate(&archive),
            Err(PipelineError::Manifest(_))
        ));
    }

    #[test]
    fn test_entry_missing_from_archive() {
        let dir = TempDir::new().unwrap();
        let listed: &[(&str, &[u8])] = &[("a-20250101.csv.gz", b"x"), ("a-20250102.csv.gz", b"y")];
        let archive = write_zip(dir.path(), Some(manifest_for("J", listed)), &listed[..1]);
        let err = ZipSource::new(".csv.gz").enumerate(&archive).unwrap_err();
        assert!(err.to_string().contains("missing from the archive"));
    }

    #[test]
    fn test_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let manifest = serde_json::json!({
            "files": [{"filename": "a-20250101.csv.gz", "size": 99, "hash": sha(b"x")}]
        })
        .to_string();
        let archive = write_zip(dir.path(), Some(manifest), &[("a-20250101.csv.gz", b"x")]);
        let err = ZipSource::new(".csv.gz").enumerate(&archive).unwrap_err();
        assert!(err.to_string().contains("declared size 99"));
    }

    #[test]
    fn test_unlisted_data_file() {
        let dir = TempDir::new().unwrap();
        let listed: &[(&str, &[u8])] = &[("a-20250101.csv.gz", b"x")];
        let present: &[(&str, &[u8])] = &[("a-20250101.csv.gz", b"x"), ("a-20250102.csv.gz", b"y")];
        let archive = write_zip(dir.path(), Some(manifest_for("J", listed)), present);
        let err = ZipSource::new(".csv.gz").enumerate(&archive).unwrap_err();
        assert!(err.to_string().contains("a-20250102.csv.gz"));
    }

    #[test]
    fn test_bad_hash_and_duplicate_dates() {
        let dir = TempDir::new().unwrap();
        let manifest = serde_json::json!({
            "files": [{"filename": "a-20250101.csv.gz", "size": 1, "hash": "md5:abc"}]
        })
        .to_string();
        let archive = write_zip(dir.path(), Some(manifest), &[("a-20250101.csv.gz", b"x")]);
        assert!(ZipSource::new(".csv.gz").enumerate(&archive).is_err());

        let dir = TempDir::new().unwrap();
        let files: &[(&str, &[u8])] = &[("a-20250101.csv.gz", b"x"), ("b-20250101.csv.gz", b"y")];
        let archive = write_zip(dir.path(), Some(manifest_for("J", files)), files);
        let err = ZipSource::new(".csv.gz").enumerate(&archive).unwrap_err();
        assert!(err.to_string().contains("both map to date 2025-01-01"));
    }

    #[test]
    fn test_no_data_entries() {
        let dir = TempDir::new().unwrap();
        let files: &[(&str, &[u8])] = &[("metadata.json", b"{}")];
        let archive = write_zip(dir.path(), Some(manifest_for("J", files)), files);
        let err = ZipSource::new(".csv.gz").enumerate(&archive).unwrap_err();
        assert!(err.to_string().contains("no '*.csv.gz' data files"));
    }

    #[test]
    fn test_extract_single_member() {
        let dir = TempDir::new().unwrap();
        let files: &[(&str, &[u8])] = &[("a-20250101.csv.gz", b"first"), ("a-20250102.csv.gz", b"second")];
        let archive = write_zip(dir.path(), Some(manifest_for("J", files)), files);

        let source = ZipSource::new(".csv.gz");
        let listing = source.enumerate(&archive).unwrap();
        let dest = dir.path().join("out.bin");
        let written = source.extract_to(&archive, &listing.units[1], &dest).unwrap();

        assert_eq!(written, 6);
        assert_eq!(std::fs::read(&dest).unwrap(), b"second");
    }

    #[test]
    fn test_run_identity_fallback_and_sanitising() {
        assert_eq!(run_identity(Some("OPRA 2025/08"), Path::new("x.zip")), "OPRA_2025_08");
        assert_eq!(run_identity(None, Path::new("/data/my job.zip")), "my_job");
        assert_eq!(run_identity(Some("  "), Path::new("/data/ok-1.2.zip")), "ok-1.2");
    }
}
