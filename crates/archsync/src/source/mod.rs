//! Pluggable unit sources
//!
//! A source knows how to list the work units inside an archive and how to
//! pull the bytes of exactly one unit out of it. Providers are registered in a
//! [`SourceRegistry`] keyed by a short identifier and selected through
//! `source_kind` in the configuration.

pub mod zip;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::unit::WorkUnit;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub use self::zip::ZipSource;

/// Result of enumerating an archive
#[derive(Debug, Clone)]
pub struct ArchiveListing {
    /// Stable identity used to name the state file
    pub run_identity: String,
    /// SHA-256 of the archive's manifest
    pub fingerprint: String,
    /// Units in ascending key order
    pub units: Vec<WorkUnit>,
}

impl ArchiveListing {
    pub fn largest_unit_bytes(&self) -> u64 {
        self.units.iter().map(|u| u.expected_size).max().unwrap_or(0)
    }
}

/// Capability set every source provides
pub trait UnitSource: Send + Sync {
    /// Registry identifier
    fn id(&self) -> &'static str;

    /// List the units in `archive`. Deterministic and side-effect free.
    fn enumerate(&self, archive: &Path) -> Result<ArchiveListing>;

    /// Stream one unit's raw bytes into `dest`, returning the byte count.
    ///
    /// Read failures on the archive side are integrity errors; failures writing
    /// `dest` are I/O errors.
    fn extract_to(&self, archive: &Path, unit: &WorkUnit, dest: &Path) -> Result<u64>;
}

/// Lookup table of source providers
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn UnitSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers
    pub fn with_defaults(config: &PipelineConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ZipSource::new(config.member_suffix.clone())));
        registry
    }

    pub fn register(&mut self, source: Arc<dyn UnitSource>) {
        self.sources.insert(source.id().to_string(), source);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn UnitSource>> {
        self.sources
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownSource(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }
}
