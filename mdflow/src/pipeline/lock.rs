//! Advisory lock on a root work directory.

use crate::errors::{ConcurrentRunError, Result};
use crate::utils::iso_timestamp;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock file created in the root work directory while a run is active.
pub const LOCK_FILE: &str = ".mdflow.lock";

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    /// The run holding the lock.
    pub run_id: String,
    /// Process ID of the holder.
    pub pid: u32,
    /// When the lock was taken.
    pub started_at: String,
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run {} (pid {}, since {})", self.run_id, self.pid, self.started_at)
    }
}

/// Held lock; the file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Takes the lock for `run_id`, creating `root` if needed.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrentRunError` if the lock file already exists, or an
    /// I/O error if the root cannot be written.
    pub fn acquire(root: &Path, run_id: Uuid) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = Self::holder(root)
                    .map_or_else(|| "unknown holder".to_string(), |h| h.to_string());
                return Err(ConcurrentRunError::new(root, holder, &path).into());
            }
            Err(e) => return Err(e.into()),
        };

        let holder = LockHolder {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            started_at: iso_timestamp(),
        };
        let lock = Self { path };
        file.write_all(serde_json::to_string(&holder)?.as_bytes())?;
        debug!(lock = %lock.path.display(), run_id = %run_id, "Acquired work directory lock");
        Ok(lock)
    }

    /// Reads the current holder of the lock in `root`, if any.
    #[must_use]
    pub fn holder(root: &Path) -> Option<LockHolder> {
        let text = std::fs::read_to_string(root.join(LOCK_FILE)).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release work directory lock");
        }
    }
}
