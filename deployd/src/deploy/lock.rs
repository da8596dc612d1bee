//! Per-source-directory exclusive lock

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::debug;

use crate::errors::DeployError;
use crate::utils::sha256_hash;

const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Advisory lock on a working copy, released on drop
#[derive(Debug)]
pub struct SourceLock {
    file: fs::File,
    path: PathBuf,
}

impl SourceLock {
    /// Lock file under `locks_dir` for a source directory
    pub fn lock_path(locks_dir: &Path, source: &Path) -> PathBuf {
        let key = fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf());
        let digest = sha256_hash(key.to_string_lossy().as_bytes());
        locks_dir.join(format!("{}.lock", digest))
    }

    /// Block until the lock is held or `wait` elapses
    pub fn acquire(locks_dir: &Path, source: &Path, wait: Duration) -> Result<Self, DeployError> {
        fs::create_dir_all(locks_dir)?;
        let path = Self::lock_path(locks_dir, source);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Locked {} ({})", source.display(), path.display());
                    return Ok(Self { file, path });
                }
                Err(_) if started.elapsed() < wait => thread::sleep(RETRY_INTERVAL),
                Err(e) => {
                    return Err(DeployError::InfrastructureError(format!(
                        "source directory {} is locked by another run ({}s): {}",
                        source.display(),
                        wait.as_secs(),
                        e
                    )))
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SourceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
