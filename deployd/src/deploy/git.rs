//! Version control collaborator

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};

use crate::deploy::shell;
use crate::deploy::stage::StageResult;
use crate::errors::DeployError;

/// Source fetch interface used by the pipeline
pub trait Vcs: Send + Sync {
    /// Fetch and merge `branch` (the tracked upstream when empty) into the
    /// working copy at `dir`
    fn pull(&self, dir: &Path, branch: &str) -> Result<StageResult, DeployError>;

    /// Commit hash checked out in `dir`
    fn current_commit(&self, dir: &Path) -> Result<String, DeployError>;
}

/// `git` command line client
#[derive(Debug, Clone)]
pub struct GitCli {
    pub timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
        }
    }
}

impl GitCli {
    fn command(&self, dir: &Path) -> Command {
        let mut cmd = Command::new("git");
        // The daemon usually runs as root against checkouts owned by others
        cmd.current_dir(dir)
            .args(["-c", "safe.directory=*"])
            .env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }
}

impl Vcs for GitCli {
    fn pull(&self, dir: &Path, branch: &str) -> Result<StageResult, DeployError> {
        info!("Pulling {} in {}", if branch.is_empty() { "upstream" } else { branch }, dir.display());
        let mut cmd = self.command(dir);
        cmd.arg("pull");
        if !branch.is_empty() {
            cmd.args(["origin", branch]);
        }
        Ok(shell::run(&mut cmd, self.timeout)?.into_stage("fetch", self.timeout))
    }

    fn current_commit(&self, dir: &Path) -> Result<String, DeployError> {
        let mut cmd = self.command(dir);
        cmd.args(["rev-parse", "HEAD"]);
        let output = shell::run(&mut cmd, self.timeout)?;
        if !output.success() {
            return Err(DeployError::stage("fetch", output.combined()));
        }
        let commit = output.stdout.trim().to_string();
        debug!("HEAD of {} is {}", dir.display(), commit);
        Ok(commit)
    }
}
