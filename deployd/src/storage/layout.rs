//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::DeployError;
use crate::filesys::dir::Dir;

/// On-disk layout for deployd state
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// One JSON record per deployment
    pub fn deployments_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("deployments"))
    }

    /// One JSON history list per deployment
    pub fn history_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("history"))
    }

    /// Lock files serializing work on a source directory
    pub fn locks_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("locks"))
    }

    /// Generated stack files
    pub fn stacks_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("stacks"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), DeployError> {
        self.deployments_dir().create().await?;
        self.history_dir().create().await?;
        self.locks_dir().create().await?;
        self.stacks_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/var/lib/deployd")
    }
}
