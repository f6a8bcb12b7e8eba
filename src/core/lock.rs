//! Exclusive per-project run lock.
//!
//! Two runs of the same project, in this process or another, would race on
//! its checkpoints and status. The lock file lives at
//! `{home}/locks/{project_id}.lock` and is held for the whole run.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::PipelineError;

/// Held lock; released on drop
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock for `project_id` without waiting
    pub fn acquire(lock_dir: &Path, project_id: &str) -> Result<Self, PipelineError> {
        std::fs::create_dir_all(lock_dir).map_err(|e| {
            PipelineError::Configuration(format!(
                "cannot create lock directory {}: {}",
                lock_dir.display(),
                e
            ))
        })?;

        let path = lock_dir.join(format!("{}.lock", project_id));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| {
                PipelineError::Configuration(format!(
                    "cannot open lock file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        file.try_lock_exclusive().map_err(|_| {
            PipelineError::Configuration(format!(
                "project '{}' is already being run (lock held on {})",
                project_id,
                path.display()
            ))
        })?;

        debug!(lock = %path.display(), "Acquired run lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
