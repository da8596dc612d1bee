//! Stream frames sent to live subscribers

use serde::{Deserialize, Serialize};

use crate::deploy::executor::infer_phase;
use crate::models::deployment::DeploymentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Snapshot sent right after attaching
    Initial,
    Update,
    Heartbeat,
    /// Terminal state of a run
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeploymentStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl StreamFrame {
    fn with_logs(kind: FrameKind, logs: &str, status: DeploymentStatus) -> Self {
        Self {
            kind,
            logs: Some(logs.to_string()),
            status: Some(status),
            phase: infer_phase(logs),
        }
    }

    pub fn initial(logs: &str, status: DeploymentStatus) -> Self {
        Self::with_logs(FrameKind::Initial, logs, status)
    }

    pub fn update(logs: &str, status: DeploymentStatus) -> Self {
        Self::with_logs(FrameKind::Update, logs, status)
    }

    pub fn final_state(logs: &str, status: DeploymentStatus) -> Self {
        Self::with_logs(FrameKind::Final, logs, status)
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: FrameKind::Heartbeat,
            logs: None,
            status: None,
            phase: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"heartbeat"}"#.to_string())
    }
}
