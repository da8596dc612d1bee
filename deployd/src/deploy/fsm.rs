//! Finite state machine for deployment runs

use crate::models::deployment::DeploymentStatus;

/// Run lifecycle event
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Start a pipeline run
    Trigger,

    /// Pipeline finished successfully
    Succeed,

    /// Pipeline aborted or crashed
    Fail(String),

    /// Found running at startup with no live worker
    Abandon,
}

/// Run FSM seeded from a persisted status
#[derive(Debug, Clone)]
pub struct RunFsm {
    state: DeploymentStatus,
    error: Option<String>,
}

impl RunFsm {
    pub fn new(state: DeploymentStatus) -> Self {
        Self { state, error: None }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentStatus {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: RunEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            // A new run may start from any terminal or idle state
            (
                DeploymentStatus::Idle | DeploymentStatus::Success | DeploymentStatus::Failed,
                RunEvent::Trigger,
            ) => {
                self.error = None;
                DeploymentStatus::Running
            }

            // From Running
            (DeploymentStatus::Running, RunEvent::Succeed) => DeploymentStatus::Success,
            (DeploymentStatus::Running, RunEvent::Fail(err)) => {
                self.error = Some(err.clone());
                DeploymentStatus::Failed
            }
            (DeploymentStatus::Running, RunEvent::Abandon) => {
                self.error = Some("interrupted by daemon restart".to_string());
                DeploymentStatus::Failed
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}
