//! Raw unit to columnar artifact conversion

pub mod parquet;

use crate::error::Result;
use std::path::Path;

pub use self::parquet::ParquetConverter;

/// File name of the converted artifact, both in scratch and remotely
pub const ARTIFACT_FILE_NAME: &str = "data.parquet";

/// Outcome of one conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionStats {
    pub rows: u64,
    pub bytes: u64,
}

/// Deterministic transform from a raw file to an artifact.
///
/// Implementations never touch the network or the archive and never embed
/// wall-clock data, so the same input always yields the same bytes.
pub trait Converter: Send + Sync {
    fn convert(&self, raw: &Path, artifact: &Path) -> Result<ConversionStats>;
}
