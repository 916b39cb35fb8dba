//! Verified, retrying artifact upload

use crate::error::{PipelineError, Result};
use crate::storage::{ObjectMeta, ObjectStore, StorageConfig, StoreResult};
use archsync_common::checksum::{compute_file_digests, ContentDigests};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Remote key for one unit: `<prefix>/underlying=<symbol>/date=<date>/data.parquet`
pub fn object_key(prefix: &str, underlying: &str, date_key: &str) -> String {
    format!(
        "{}/underlying={}/date={}/{}",
        prefix.trim_matches('/'),
        underlying,
        date_key,
        crate::convert::ARTIFACT_FILE_NAME
    )
}

/// Date encoded in a data object key, if the key follows the layout
pub fn date_from_key(key: &str) -> Option<&str> {
    key.split('/')
        .find_map(|segment| segment.strip_prefix("date="))
}

/// What a completed upload produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub location: String,
    pub sha256: String,
    pub size: u64,
    pub etag: Option<String>,
}

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: &StorageConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Digests of a local artifact, computed off the async runtime
    pub async fn digests(path: &Path) -> Result<ContentDigests> {
        let owned: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || compute_file_digests(owned))
            .await
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("digest task failed: {e}")))?
            .map_err(PipelineError::from)
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out
    async fn with_retries<T, F, Fut>(&self, key: &str, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            debug!(key, attempt, max = self.max_attempts, "{} attempt", what);
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} attempt {}/{} for {} failed: {}. Retrying in {:?}...",
                        what, attempt, self.max_attempts, key, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(PipelineError::Upload {
                        key: key.to_string(),
                        attempts: attempt,
                        detail: e.to_string(),
                    })
                }
            }
        }
    }

    /// Upload `artifact` to `key` and confirm the remote copy matches.
    ///
    /// Re-uploading identical content to the same key is safe.
    #[instrument(skip(self, artifact))]
    pub async fn upload(&self, artifact: &Path, key: &str) -> Result<UploadReceipt> {
        let digests = Self::digests(artifact).await?;

        let outcome = self
            .with_retries(key, "Upload", || self.store.put_file(key, artifact, &digests))
            .await?;

        let remote = self
            .with_retries(key, "Verification", || self.store.head(key))
            .await?;

        verify_remote(key, remote.as_ref(), &digests)?;

        let location = self.store.describe(key);
        info!(location = %location, bytes = digests.size, "Uploaded and verified");

        Ok(UploadReceipt {
            key: key.to_string(),
            location,
            sha256: digests.sha256_hex,
            size: digests.size,
            etag: remote.and_then(|m| m.etag).or(outcome.etag),
        })
    }
}

fn verify_remote(
    key: &str,
    remote: Option<&ObjectMeta>,
    digests: &ContentDigests,
) -> Result<()> {
    let meta = remote.ok_or_else(|| PipelineError::verification(key, "object missing after upload"))?;

    if meta.size != digests.size {
        return Err(PipelineError::verification(
            key,
            format!("size {} differs from local {}", meta.size, digests.size),
        ));
    }

    match meta.sha256.as_deref() {
        Some(remote_sha) if remote_sha.eq_ignore_ascii_case(&digests.sha256_hex) => Ok(()),
        Some(remote_sha) => Err(PipelineError::verification(
            key,
            format!("sha256 {} differs from local {}", remote_sha, digests.sha256_hex),
        )),
        None => Err(PipelineError::verification(key, "no sha256 metadata on remote object")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreError};
    use std::io::Write;

    fn fast_config(max_attempts: u32) -> StorageConfig {
        StorageConfig {
            max_attempts,
            base_backoff_ms: 1,
            ..StorageConfig::default()
        }
    }

    fn artifact(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    const KEY: &str = "options/cbbo-1m/underlying=SPY/date=2025-01-01/data.parquet";

    #[test]
    fn test_object_key_layout() {
        assert_eq!(object_key("options/cbbo-1m/", "SPY", "2025-01-01"), KEY);
        assert_eq!(date_from_key(KEY), Some("2025-01-01"));
        assert_eq!(date_from_key("options/cbbo-1m/.preflight_test"), None);
    }

    #[test]
    fn test_backoff_is_exponential() {
        let store = Arc::new(MemoryStore::new("b"));
        let uploader = Uploader::new(store, &StorageConfig::default());
        assert_eq!(uploader.backoff(1), Duration::from_secs(2));
        assert_eq!(uploader.backoff(2), Duration::from_secs(4));
        assert_eq!(uploader.backoff(3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_upload_verifies_and_reports() {
        let store = Arc::new(MemoryStore::new("bucket"));
        let uploader = Uploader::new(store.clone(), &fast_config(3));
        let file = artifact(b"parquet bytes");

        let receipt = uploader.upload(file.path(), KEY).await.unwrap();
        assert_eq!(receipt.size, 13);
        assert_eq!(receipt.location, format!("memory://bucket/{KEY}"));
        assert_eq!(store.object(KEY).unwrap(), b"parquet bytes");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(MemoryStore::new("bucket"));
        store.fail_next_put(StoreError::Transient("SlowDown".into()));
        store.fail_next_put(StoreError::Transient("connection reset".into()));
        let uploader = Uploader::new(store.clone(), &fast_config(3));
        let file = artifact(b"data");

        uploader.upload(file.path(), KEY).await.unwrap();
        assert_eq!(store.put_count(KEY), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_upload_errors() {
        let store = Arc::new(MemoryStore::new("bucket"));
        for _ in 0..3 {
            store.fail_next_put(StoreError::Transient("timeout".into()));
        }
        let uploader = Uploader::new(store.clone(), &fast_config(3));
        let file = artifact(b"data");

        let err = uploader.upload(file.path(), KEY).await.unwrap_err();
        assert!(matches!(err, PipelineError::Upload { attempts: 3, .. }));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let store = Arc::new(MemoryStore::new("bucket"));
        store.fail_next_put(StoreError::Permanent("AccessDenied".into()));
        let uploader = Uploader::new(store.clone(), &fast_config(3));
        let file = artifact(b"data");

        let err = uploader.upload(file.path(), KEY).await.unwrap_err();
        assert!(matches!(err, PipelineError::Upload { attempts: 1, .. }));
        assert!(err.summary().starts_with("UploadError"));
        // the queue is empty again, so nothing else was attempted
        uploader.upload(file.path(), KEY).await.unwrap();
    }

    #[tokio::test]
    async fn test_same_content_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new("bucket"));
        let uploader = Uploader::new(store.clone(), &fast_config(1));
        let file = artifact(b"identical");

        let first = uploader.upload(file.path(), KEY).await.unwrap();
        let second = uploader.upload(file.path(), KEY).await.unwrap();
        assert_eq!(first.sha256, second.sha256);
        assert_eq!(store.keys(), vec![KEY.to_string()]);
        assert_eq!(store.object(KEY).unwrap(), b"identical");
    }

    #[test]
    fn test_verification_mismatches() {
        let digests = ContentDigests {
            sha256_hex: "aa".repeat(32),
            md5_base64: String::new(),
            size: 10,
        };
        let meta = ObjectMeta {
            key: KEY.to_string(),
            size: 10,
            sha256: Some("bb".repeat(32)),
            etag: None,
        };

        assert!(matches!(
            verify_remote(KEY, None, &digests),
            Err(PipelineError::Verification { .. })
        ));
        assert!(matches!(
            verify_remote(KEY, Some(&meta), &digests),
            Err(PipelineError::Verification { .. })
        ));
        let short = ObjectMeta { size: 9, ..meta.clone() };
        assert!(verify_remote(KEY, Some(&short), &digests).is_err());
        let good = ObjectMeta {
            sha256: Some("AA".repeat(32)),
            ..meta
        };
        assert!(verify_remote(KEY, Some(&good), &digests).is_ok());
    }
}
