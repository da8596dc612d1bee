//! Collaborator stage results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one external collaborator call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    /// Pipeline stage that produced the result
    pub stage: String,

    pub ok: bool,

    /// Captured stdout and stderr
    pub output: String,

    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    pub fn success(stage: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(stage, true, output)
    }

    pub fn failure(stage: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(stage, false, output)
    }

    fn new(stage: impl Into<String>, ok: bool, output: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ok,
            output: output.into(),
            finished_at: Utc::now(),
        }
    }
}
