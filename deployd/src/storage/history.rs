//! Run history persistence

use tokio::sync::Mutex;

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::history::{HistoryEntry, HISTORY_RETENTION};

/// Per-deployment history lists, newest first, capped at [`HISTORY_RETENTION`]
pub struct HistoryStore {
    dir: Dir,
    write_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(dir: Dir) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    fn history_file(&self, deployment_id: &str) -> Option<File> {
        uuid::Uuid::parse_str(deployment_id)
            .ok()
            .map(|uuid| self.dir.file(&format!("{}.json", uuid.hyphenated())))
    }

    /// Record a finished run
    pub async fn append(&self, entry: HistoryEntry) -> Result<(), DeployError> {
        let file = self.history_file(&entry.deployment_id).ok_or_else(|| {
            DeployError::ValidationError(format!("invalid deployment id: {}", entry.deployment_id))
        })?;
        let _guard = self.write_lock.lock().await;
        let mut entries: Vec<HistoryEntry> = file.read_json_opt().await?.unwrap_or_default();
        entries.insert(0, entry);
        entries.truncate(HISTORY_RETENTION);
        file.write_json(&entries).await
    }

    /// History of a deployment, newest first
    pub async fn list(&self, deployment_id: &str) -> Result<Vec<HistoryEntry>, DeployError> {
        match self.history_file(deployment_id) {
            Some(file) => Ok(file.read_json_opt().await?.unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    /// Drop the history of a deleted deployment
    pub async fn delete(&self, deployment_id: &str) -> Result<(), DeployError> {
        if let Some(file) = self.history_file(deployment_id) {
            let _guard = self.write_lock.lock().await;
            file.delete().await?;
        }
        Ok(())
    }
}
