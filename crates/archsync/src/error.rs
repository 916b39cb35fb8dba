//! Error types for the pipeline
//!
//! Errors fall into two scopes. Unit-scoped errors (integrity, format,
//! upload, verification) are caught at the orchestrator's per-unit boundary
//! and recorded against the unit; the run continues. Run-scoped errors
//! (manifest, preflight, concurrent run, state, config) stop the run before
//! or instead of unit work.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Archive manifest missing, unreadable or inconsistent with the archive
    #[error("Invalid archive manifest: {0}")]
    Manifest(String),

    /// Extracted bytes do not match the manifest
    #[error("Integrity check failed for '{member}': {detail}")]
    Integrity { member: String, detail: String },

    /// Raw unit could not be converted
    #[error("Malformed input: {0}")]
    Format(String),

    /// Transfer failed permanently or retries were exhausted
    #[error("Upload of '{key}' failed after {attempts} attempt(s): {detail}")]
    Upload {
        key: String,
        attempts: u32,
        detail: String,
    },

    /// Remote object disagrees with what was sent
    #[error("Remote object '{key}' failed verification: {detail}")]
    Verification { key: String, detail: String },

    /// Environment not ready for a run
    #[error("Pre-flight checks failed:\n{}", .0.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
    Preflight(Vec<String>),

    /// Another process holds the run lock
    #[error("Another run is already active for '{identity}' (lock: {lock_path})")]
    ConcurrentRun { identity: String, lock_path: String },

    /// State store could not be read or written
    #[error("State store error: {0}")]
    State(String),

    #[error("Configuration error: {0}. Check your environment variables or config file.")]
    Config(String),

    #[error("Unknown source kind '{0}'")]
    UnknownSource(String),

    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    pub fn integrity(member: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Integrity {
            member: member.into(),
            detail: detail.into(),
        }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn verification(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Verification {
            key: key.into(),
            detail: detail.into(),
        }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Short name of the error class, used as the prefix of recorded summaries
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Manifest(_) => "ManifestError",
            Self::Integrity { .. } => "IntegrityError",
            Self::Format(_) => "FormatError",
            Self::Upload { .. } => "UploadError",
            Self::Verification { .. } => "VerificationError",
            Self::Preflight(_) => "PreflightError",
            Self::ConcurrentRun { .. } => "ConcurrentRunError",
            Self::State(_) => "StateError",
            Self::Config(_) | Self::UnknownSource(_) => "ConfigError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
            Self::Other(_) => "Error",
        }
    }

    /// Whether the error is confined to one unit and the run may continue
    pub fn is_unit_scoped(&self) -> bool {
        matches!(
            self,
            Self::Integrity { .. }
                | Self::Format(_)
                | Self::Upload { .. }
                | Self::Verification { .. }
                | Self::Io(_)
        )
    }

    /// One-line summary recorded in the state file for a failed unit
    pub fn summary(&self) -> String {
        let text = self.to_string().replace('\n', " ");
        format!("{}: {}", self.kind(), text)
    }
}

impl From<archsync_common::CommonError> for PipelineError {
    fn from(err: archsync_common::CommonError) -> Self {
        use archsync_common::CommonError;
        match err {
            CommonError::Io(e) => Self::Io(e),
            CommonError::Serialization(e) => Self::Json(e),
            CommonError::ChecksumMismatch {
                subject,
                expected,
                actual,
            } => Self::integrity(
                subject,
                format!("expected sha256 {expected}, got {actual}"),
            ),
            CommonError::Config(msg) => Self::Config(msg),
            CommonError::Parse(msg) => Self::Other(anyhow::anyhow!(msg)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_is_prefixed_and_single_line() {
        let err = PipelineError::integrity("day-2.csv.gz", "expected sha256 aa, got bb");
        let summary = err.summary();
        assert!(summary.starts_with("IntegrityError: "));
        assert!(summary.contains("day-2.csv.gz"));

        let preflight = PipelineError::Preflight(vec!["a".into(), "b".into()]);
        assert!(!preflight.summary().contains('\n'));
    }

    #[test]
    fn test_scope_classification() {
        assert!(PipelineError::format("bad row").is_unit_scoped());
        assert!(PipelineError::verification("k", "size").is_unit_scoped());
        assert!(!PipelineError::manifest("missing").is_unit_scoped());
        assert!(!PipelineError::state("disk full").is_unit_scoped());
        assert!(!PipelineError::ConcurrentRun {
            identity: "x".into(),
            lock_path: "x.lock".into()
        }
        .is_unit_scoped());
    }
}
