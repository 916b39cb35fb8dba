//! Pipeline configuration
//!
//! Resolved once in `main` and passed by reference. Precedence, lowest first:
//! built-in defaults, the TOML file (`archsync.toml` or `--config PATH`),
//! then the environment (`ARCHSYNC_*`, nested keys separated by `__`, plus
//! the conventional `S3_*` / `AWS_DEFAULT_REGION` / `UNDERLYING_SYMBOL` names).

use crate::error::{PipelineError, Result};
use crate::storage::config::{self as storage_defaults, StorageConfig, MIN_MULTIPART_CHUNK_BYTES};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "archsync.toml";

pub const DEFAULT_STATE_DIR: &str = ".archsync";
pub const DEFAULT_SOURCE_KIND: &str = "zip";
pub const DEFAULT_MEMBER_SUFFIX: &str = ".csv.gz";
pub const DEFAULT_UNDERLYING_SYMBOL: &str = "SPY";
pub const DEFAULT_SCRATCH_SAFETY_MULTIPLE: u64 = 3;
pub const DEFAULT_STALE_UPLOAD_MAX_AGE_HOURS: u64 = 24;

const ENV_PREFIX: &str = "ARCHSYNC";

/// Conventional variable names accepted alongside `ARCHSYNC_*`.
/// The `ARCHSYNC_*` form wins when both are set.
const CONVENTIONAL_ENV: &[(&str, &str)] = &[
    ("S3_BUCKET_NAME", "storage.bucket"),
    ("S3_PREFIX", "storage.prefix"),
    ("AWS_DEFAULT_REGION", "storage.region"),
    ("S3_ENDPOINT", "storage.endpoint"),
    ("S3_ACCESS_KEY", "storage.access_key"),
    ("S3_SECRET_KEY", "storage.secret_key"),
    ("UNDERLYING_SYMBOL", "underlying_symbol"),
];

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding state and lock files
    pub state_dir: PathBuf,

    /// Scratch root; the archive's directory when unset
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Registered source provider to enumerate and extract with
    pub source_kind: String,

    /// Archive members with this suffix are data units
    pub member_suffix: String,

    pub underlying_symbol: String,

    /// Keep scratch directories after each unit
    #[serde(default)]
    pub keep_scratch: bool,

    /// Free scratch space required, as a multiple of the largest unit
    pub scratch_safety_multiple: u64,

    pub stale_upload_max_age_hours: u64,

    pub storage: StorageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            scratch_dir: None,
            source_kind: DEFAULT_SOURCE_KIND.to_string(),
            member_suffix: DEFAULT_MEMBER_SUFFIX.to_string(),
            underlying_symbol: DEFAULT_UNDERLYING_SYMBOL.to_string(),
            keep_scratch: false,
            scratch_safety_multiple: DEFAULT_SCRATCH_SAFETY_MULTIPLE,
            stale_upload_max_age_hours: DEFAULT_STALE_UPLOAD_MAX_AGE_HOURS,
            storage: StorageConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// An explicit `path` must exist; the default `archsync.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p.to_path_buf()).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let mut builder = Self::defaults_builder()?
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        for (var, key) in CONVENTIONAL_ENV {
            let native = format!("{ENV_PREFIX}_{}", key.replace('.', "__").to_uppercase());
            if std::env::var_os(&native).is_some() {
                continue;
            }
            if let Ok(value) = std::env::var(var) {
                builder = builder
                    .set_override(*key, value)
                    .map_err(|e| PipelineError::config(e.to_string()))?;
            }
        }

        let config: PipelineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PipelineError::config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn defaults_builder() -> Result<::config::ConfigBuilder<::config::builder::DefaultState>> {
        let d = Self::default();
        let s = d.storage;
        Config::builder()
            .set_default("state_dir", DEFAULT_STATE_DIR)?
            .set_default("source_kind", d.source_kind)?
            .set_default("member_suffix", d.member_suffix)?
            .set_default("underlying_symbol", d.underlying_symbol)?
            .set_default("keep_scratch", d.keep_scratch)?
            .set_default("scratch_safety_multiple", d.scratch_safety_multiple as i64)?
            .set_default("stale_upload_max_age_hours", d.stale_upload_max_age_hours as i64)?
            .set_default("storage.bucket", s.bucket)?
            .set_default("storage.prefix", storage_defaults::DEFAULT_PREFIX)?
            .set_default("storage.region", storage_defaults::DEFAULT_REGION)?
            .set_default("storage.path_style", s.path_style)?
            .set_default("storage.max_attempts", s.max_attempts as i64)?
            .set_default("storage.base_backoff_ms", s.base_backoff_ms as i64)?
            .set_default("storage.attempt_timeout_secs", s.attempt_timeout_secs as i64)?
            .set_default("storage.multipart_threshold_bytes", s.multipart_threshold_bytes as i64)?
            .set_default("storage.multipart_chunk_bytes", s.multipart_chunk_bytes as i64)
            .map_err(Into::into)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.normalized_prefix().is_empty() {
            return Err(PipelineError::config("storage.prefix cannot be empty"));
        }

        if self.storage.max_attempts == 0 {
            return Err(PipelineError::config("storage.max_attempts must be greater than 0"));
        }

        if self.storage.multipart_chunk_bytes < MIN_MULTIPART_CHUNK_BYTES {
            return Err(PipelineError::config(format!(
                "storage.multipart_chunk_bytes ({}) is below the 5 MiB minimum",
                self.storage.multipart_chunk_bytes
            )));
        }

        if self.scratch_safety_multiple == 0 {
            return Err(PipelineError::config("scratch_safety_multiple must be greater than 0"));
        }

        if self.member_suffix.is_empty() {
            return Err(PipelineError::config("member_suffix cannot be empty"));
        }

        Ok(())
    }

    /// Scratch root for a given archive
    pub fn scratch_root(&self, archive: &Path) -> PathBuf {
        match &self.scratch_dir {
            Some(dir) => dir.clone(),
            None => archive
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

impl From<::config::ConfigError> for PipelineError {
    fn from(err: ::config::ConfigError) -> Self {
        PipelineError::config(err.to_string())
    }
}
