use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PREFIX: &str = "options/cbbo-1m";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 2000;
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MULTIPART_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MULTIPART_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

/// Smallest part S3 accepts for all but the last part of a multipart upload
pub const MIN_MULTIPART_CHUNK_BYTES: u64 = 5 * 1024 * 1024;

/// Destination and transfer settings for the object store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub path_style: bool,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub attempt_timeout_secs: u64,
    pub multipart_threshold_bytes: u64,
    pub multipart_chunk_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: DEFAULT_PREFIX.to_string(),
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            path_style: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            attempt_timeout_secs: DEFAULT_ATTEMPT_TIMEOUT_SECS,
            multipart_threshold_bytes: DEFAULT_MULTIPART_THRESHOLD_BYTES,
            multipart_chunk_bytes: DEFAULT_MULTIPART_CHUNK_BYTES,
        }
    }
}

impl StorageConfig {
    /// Local S3-compatible endpoint (MinIO and friends)
    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
            ..Self::default()
        }
    }

    /// Whether static keys were supplied; otherwise the default AWS chain is used
    pub fn has_static_credentials(&self) -> bool {
        matches!(
            (&self.access_key, &self.secret_key),
            (Some(a), Some(s)) if !a.is_empty() && !s.is_empty()
        )
    }

    /// Prefix without leading or trailing slashes
    pub fn normalized_prefix(&self) -> String {
        self.prefix.trim_matches('/').to_string()
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}
