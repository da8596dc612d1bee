//! Process supervisor collaborator

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::info;

use crate::deploy::shell;
use crate::deploy::stage::StageResult;
use crate::errors::DeployError;

pub trait Supervisor: Send + Sync {
    fn restart(&self, process: &str) -> Result<StageResult, DeployError>;
}

/// `supervisorctl` client
#[derive(Debug, Clone)]
pub struct SupervisorCtl {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl Default for SupervisorCtl {
    fn default() -> Self {
        Self {
            program: PathBuf::from("supervisorctl"),
            timeout: Duration::from_secs(120),
        }
    }
}

impl Supervisor for SupervisorCtl {
    fn restart(&self, process: &str) -> Result<StageResult, DeployError> {
        info!("Restarting supervised process {}", process);
        let mut cmd = Command::new(&self.program);
        cmd.args(["restart", process]);
        Ok(shell::run(&mut cmd, self.timeout)?.into_stage("restart", self.timeout))
    }
}
