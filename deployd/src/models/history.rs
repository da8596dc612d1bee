//! Run history models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::deployment::DeploymentStatus;

/// Number of history entries retained per deployment
pub const HISTORY_RETENTION: usize = 20;

/// One finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub deployment_id: String,
    pub kind: String,
    pub status: DeploymentStatus,
    pub commit_hash: Option<String>,
    pub image_tag: Option<String>,
    pub deployed_at: DateTime<Utc>,
}
