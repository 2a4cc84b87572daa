//! Per-target advisory locking
//!
//! Exactly one writer may work on a target's chain at a time. Sync,
//! consolidation and restore from the local manifest take an exclusive,
//! non-blocking `flock`-style lock on `<state_dir>/<target>/.lock`. A second
//! invocation fails fast with [`ChainError::TargetLocked`] instead of racing
//! the first one to decide the next artifact.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{ChainError, Result};
use crate::manifest::ManifestStore;

/// Held exclusive lock on one target; released on drop
#[derive(Debug)]
pub struct TargetLock {
    file: File,
    path: PathBuf,
}

impl TargetLock {
    /// Try to take the lock at `path` without blocking
    pub fn acquire(path: &Path, target: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Locked target {}", target);
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(ChainError::TargetLocked(target.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {:?}: {}", self.path, e);
        }
    }
}

/// Run `f` while holding the exclusive lock of `target`
pub fn with_target_lock<T>(store: &ManifestStore, target: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _lock = TargetLock::acquire(&store.lock_path(target), target)?;
    f()
}
