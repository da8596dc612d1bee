//! Deployment persistence

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::Deployment;

/// Mutation applied to a record inside [`DeploymentStore::update`]
pub type Mutation<'a> = Box<dyn FnOnce(&mut Deployment) + Send + 'a>;

/// Persistence layer for deployment records
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Fetch a record; `None` for unknown ids
    async fn get(&self, id: &str) -> Result<Option<Deployment>, DeployError>;

    /// All records, oldest first
    async fn list(&self) -> Result<Vec<Deployment>, DeployError>;

    /// Persist a new record
    async fn insert(&self, deployment: &Deployment) -> Result<(), DeployError>;

    /// Read-modify-write a record atomically with respect to other writes.
    /// Returns the updated record, or `None` if the id no longer exists.
    async fn update<'a>(
        &self,
        id: &str,
        mutation: Mutation<'a>,
    ) -> Result<Option<Deployment>, DeployError>;

    /// Remove a record; `false` if it did not exist
    async fn delete(&self, id: &str) -> Result<bool, DeployError>;
}

/// One pretty-printed JSON file per deployment
pub struct FileDeploymentStore {
    dir: Dir,
    write_lock: Mutex<()>,
}

impl FileDeploymentStore {
    pub fn new(dir: Dir) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    /// Record file for an id; `None` for ids that are not UUIDs
    fn record_file(&self, id: &str) -> Option<File> {
        uuid::Uuid::parse_str(id)
            .ok()
            .map(|uuid| self.dir.file(&format!("{}.json", uuid.hyphenated())))
    }

    async fn read(&self, id: &str) -> Result<Option<Deployment>, DeployError> {
        match self.record_file(id) {
            Some(file) => file.read_json_opt().await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DeploymentStore for FileDeploymentStore {
    async fn get(&self, id: &str) -> Result<Option<Deployment>, DeployError> {
        self.read(id).await
    }

    async fn list(&self) -> Result<Vec<Deployment>, DeployError> {
        let mut deployments = Vec::new();
        for path in self.dir.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match File::new(&path).read_json::<Deployment>().await {
                Ok(deployment) => deployments.push(deployment),
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deployments)
    }

    async fn insert(&self, deployment: &Deployment) -> Result<(), DeployError> {
        let file = self.record_file(&deployment.id).ok_or_else(|| {
            DeployError::ValidationError(format!("invalid deployment id: {}", deployment.id))
        })?;
        let _guard = self.write_lock.lock().await;
        if file.exists().await {
            return Err(DeployError::StorageError(format!(
                "deployment {} already exists",
                deployment.id
            )));
        }
        file.write_json(deployment).await
    }

    async fn update<'a>(
        &self,
        id: &str,
        mutation: Mutation<'a>,
    ) -> Result<Option<Deployment>, DeployError> {
        let Some(file) = self.record_file(id) else {
            return Ok(None);
        };
        let _guard = self.write_lock.lock().await;
        let Some(mut deployment) = file.read_json_opt::<Deployment>().await? else {
            debug!("Update of missing deployment {} dropped", id);
            return Ok(None);
        };
        mutation(&mut deployment);
        file.write_json(&deployment).await?;
        Ok(Some(deployment))
    }

    async fn delete(&self, id: &str) -> Result<bool, DeployError> {
        let Some(file) = self.record_file(id) else {
            return Ok(false);
        };
        let _guard = self.write_lock.lock().await;
        if !file.exists().await {
            return Ok(false);
        }
        file.delete().await?;
        Ok(true)
    }
}
