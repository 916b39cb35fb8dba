//! Remote object storage
//!
//! [`ObjectStore`] is the seam between the pipeline and wherever artifacts
//! land. [`s3::S3Store`] talks to S3 or an S3-compatible endpoint;
//! [`memory::MemoryStore`] keeps objects in memory and can inject faults.

pub mod config;
pub mod memory;
pub mod s3;

use archsync_common::checksum::ContentDigests;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use self::config::StorageConfig;
pub use self::memory::MemoryStore;
pub use self::s3::S3Store;

/// User metadata key carrying the artifact's hex SHA-256
pub const SHA256_METADATA_KEY: &str = "sha256";

/// Object written by preflight to prove write access
pub const PREFLIGHT_OBJECT: &str = ".preflight_test";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network trouble, throttling, server-side errors; worth retrying
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Auth, permission, bad request; retrying will not help
    #[error("storage request rejected: {0}")]
    Permanent(String),

    #[error("object not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Metadata of one remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// From the object's `sha256` user metadata; listings do not carry it
    pub sha256: Option<String>,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub etag: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location of `key`, e.g. `s3://bucket/key`
    fn describe(&self, key: &str) -> String;

    /// Upload a file, asserting its MD5 at the transport level and recording
    /// its SHA-256 as object metadata
    async fn put_file(&self, key: &str, path: &Path, digests: &ContentDigests)
        -> StoreResult<PutOutcome>;

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> StoreResult<()>;

    /// `None` when the object does not exist
    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>>;

    /// Every object under `prefix`, following pagination
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>>;

    async fn read_range(&self, key: &str, start: u64, len: u64) -> StoreResult<Vec<u8>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Fail if no usable credentials can be resolved
    async fn check_credentials(&self) -> StoreResult<()>;

    /// Fail if the destination bucket cannot be reached
    async fn check_destination(&self) -> StoreResult<()>;

    /// Abort incomplete multipart uploads under `prefix` older than `max_age`.
    /// Returns how many were aborted.
    async fn abort_stale_uploads(&self, _prefix: &str, _max_age: Duration) -> StoreResult<usize> {
        Ok(0)
    }

    /// Reachability plus a write/delete round trip under `prefix`
    async fn probe(&self, prefix: &str) -> StoreResult<()> {
        self.check_destination().await?;
        let key = format!("{prefix}/{PREFLIGHT_OBJECT}");
        self.put_bytes(&key, b"preflight".to_vec()).await?;
        self.delete(&key).await
    }
}
