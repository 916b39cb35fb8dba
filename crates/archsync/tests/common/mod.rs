//! Shared fixtures: small quote archives with a manifest

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use archsync::PipelineConfig;
use archsync_common::checksum::compute_checksum;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const JOB_ID: &str = "OPRA-TEST-0001";
pub const DATES: [&str; 3] = ["2025-01-01", "2025-01-02", "2025-01-03"];

pub fn member_name(date: &str) -> String {
    format!("opra-pillar-{}.cbbo-1m.csv.gz", date.replace('-', ""))
}

/// Gzipped quote CSV for one day
pub fn quotes_for(date: &str, rows: usize) -> Vec<u8> {
    let day: i64 = date.replace('-', "").parse().unwrap();
    let mut csv = String::from("ts_event,rtype,instrument_id,bid_px,ask_px,bid_sz,ask_sz\n");
    for i in 0..rows {
        csv.push_str(&format!(
            "{},177,{},{:.2},{:.2},{},{}\n",
            1_735_689_600_000_000_000i64 + day * 1000 + i as i64,
            100 + i,
            1.5 + i as f64,
            1.6 + i as f64,
            10 + i,
            20 + i
        ));
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(csv.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// Write a zip with `manifest.json`, a metadata file and one member per date.
/// Dates in `bad_hash` get a wrong checksum in the manifest.
pub fn write_archive(path: &Path, dates: &[&str], bad_hash: &[&str]) {
    let mut zip = ZipWriter::new(std::fs::File::create(path).unwrap());
    let mut files = Vec::new();

    for date in dates {
        let data = quotes_for(date, 5);
        let hash = if bad_hash.contains(date) {
            compute_checksum(b"something else")
        } else {
            compute_checksum(&data)
        };
        files.push(serde_json::json!({
            "filename": member_name(date),
            "size": data.len(),
            "hash": format!("sha256:{hash}"),
        }));
        zip.start_file(member_name(date), SimpleFileOptions::default()).unwrap();
        zip.write_all(&data).unwrap();
    }

    let metadata = br#"{"schema":"cbbo-1m"}"#;
    files.push(serde_json::json!({
        "filename": "metadata.json",
        "size": metadata.len(),
        "hash": format!("sha256:{}", compute_checksum(metadata)),
    }));
    zip.start_file("metadata.json", SimpleFileOptions::default()).unwrap();
    zip.write_all(metadata).unwrap();

    let manifest = serde_json::json!({ "job_id": JOB_ID, "files": files });
    zip.start_file("manifest.json", SimpleFileOptions::default()).unwrap();
    zip.write_all(manifest.to_string().as_bytes()).unwrap();
    zip.finish().unwrap();
}

/// A temp workspace with an archive and a config pointing into it
pub struct Fixture {
    pub dir: TempDir,
    pub archive: PathBuf,
    pub config: PipelineConfig,
}

impl Fixture {
    pub fn new(bad_hash: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("OPRA-TEST.zip");
        write_archive(&archive, &DATES, bad_hash);

        let mut config = PipelineConfig::default();
        config.state_dir = dir.path().join("state");
        config.scratch_dir = Some(dir.path().join("scratch"));
        config.storage.bucket = "test-bucket".to_string();
        config.storage.base_backoff_ms = 1;

        Self {
            dir,
            archive,
            config,
        }
    }

    pub fn rewrite_archive(&self, bad_hash: &[&str]) {
        write_archive(&self.archive, &DATES, bad_hash);
    }

    pub fn state_file(&self) -> PathBuf {
        self.config.state_dir.join(format!("{JOB_ID}.state.json"))
    }

    pub fn key(&self, date: &str) -> String {
        format!("options/cbbo-1m/underlying=SPY/date={date}/data.parquet")
    }
}
