//! Advisory run lock
//!
//! Held for the whole run so a second process against the same run identity
//! fails fast instead of racing on the state file. The OS drops the lock if
//! the process dies.

use crate::error::{PipelineError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE_SUFFIX: &str = ".lock";

#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn lock_path(state_dir: &Path, run_identity: &str) -> PathBuf {
        state_dir.join(format!("{run_identity}{LOCK_FILE_SUFFIX}"))
    }

    /// Take the exclusive lock or fail with a concurrent-run error
    pub fn acquire(state_dir: &Path, run_identity: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir).map_err(|e| {
            PipelineError::state(format!("cannot create {}: {e}", state_dir.display()))
        })?;

        let path = Self::lock_path(state_dir, run_identity);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| PipelineError::state(format!("cannot open {}: {e}", path.display())))?;

        file.try_lock_exclusive()
            .map_err(|_| PipelineError::ConcurrentRun {
                identity: run_identity.to_string(),
                lock_path: path.display().to_string(),
            })?;

        debug!(path = %path.display(), "Acquired run lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Closing the handle would release it too
        let _ = self.file.unlock();
    }
}
