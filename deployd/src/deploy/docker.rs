//! Container runtime collaborator

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};

use crate::deploy::shell;
use crate::deploy::stage::StageResult;
use crate::errors::DeployError;

/// Running and desired task counts of one stack service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaCount {
    pub running: u32,
    pub desired: u32,
}

/// Throwaway container run to completion on the overlay network
#[derive(Debug, Clone, Default)]
pub struct OneShot {
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// `host:container:ro` bind mounts
    pub mounts: Vec<String>,
    pub network: Option<String>,
    pub workdir: Option<String>,
}

/// Image and orchestrator operations used by the swarm pipeline
pub trait ContainerRuntime: Send + Sync {
    fn build(&self, context: &Path, dockerfile: &str, tags: &[String])
        -> Result<StageResult, DeployError>;

    fn push(&self, tag: &str) -> Result<StageResult, DeployError>;

    /// Create the attachable overlay network unless it exists
    fn ensure_network(&self, name: &str) -> Result<StageResult, DeployError>;

    fn run_oneshot(&self, job: &OneShot) -> Result<StageResult, DeployError>;

    /// Submit a stack file as a rolling update
    fn deploy_stack(&self, stack: &str, stack_file: &Path) -> Result<StageResult, DeployError>;

    /// Per-role counts keyed by role name (stack prefix stripped)
    fn replica_counts(&self, stack: &str) -> Result<BTreeMap<String, ReplicaCount>, DeployError>;
}

/// Timeouts applied by [`DockerCli`]
#[derive(Debug, Clone)]
pub struct DockerTimeouts {
    pub build: Duration,
    pub push: Duration,
    pub migration: Duration,
    pub orchestrator: Duration,
}

impl Default for DockerTimeouts {
    fn default() -> Self {
        Self {
            build: Duration::from_secs(1800),
            push: Duration::from_secs(600),
            migration: Duration::from_secs(600),
            orchestrator: Duration::from_secs(120),
        }
    }
}

/// `docker` command line client
#[derive(Debug, Clone)]
pub struct DockerCli {
    pub program: PathBuf,
    pub timeouts: DockerTimeouts,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("docker"),
            timeouts: DockerTimeouts::default(),
        }
    }
}

impl DockerCli {
    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    fn run(&self, stage: &str, cmd: &mut Command, timeout: Duration) -> Result<StageResult, DeployError> {
        Ok(shell::run(cmd, timeout)?.into_stage(stage, timeout))
    }
}

impl ContainerRuntime for DockerCli {
    fn build(
        &self,
        context: &Path,
        dockerfile: &str,
        tags: &[String],
    ) -> Result<StageResult, DeployError> {
        info!("Building {} from {}", tags.join(", "), context.display());
        let mut cmd = self.command();
        cmd.current_dir(context).args(["build", "-f", dockerfile]);
        for tag in tags {
            cmd.arg("-t").arg(tag);
        }
        cmd.arg(".");
        self.run("build", &mut cmd, self.timeouts.build)
    }

    fn push(&self, tag: &str) -> Result<StageResult, DeployError> {
        info!("Pushing {}", tag);
        let mut cmd = self.command();
        cmd.args(["push", tag]);
        self.run("publish", &mut cmd, self.timeouts.push)
    }

    fn ensure_network(&self, name: &str) -> Result<StageResult, DeployError> {
        let mut inspect = self.command();
        inspect.args(["network", "inspect", name]);
        if shell::run(&mut inspect, self.timeouts.orchestrator)?.success() {
            debug!("Network {} exists", name);
            return Ok(StageResult::success("network", format!("network {} exists\n", name)));
        }

        info!("Creating overlay network {}", name);
        let mut create = self.command();
        create.args(["network", "create", "--driver", "overlay", "--attachable", name]);
        self.run("network", &mut create, self.timeouts.orchestrator)
    }

    fn run_oneshot(&self, job: &OneShot) -> Result<StageResult, DeployError> {
        let mut cmd = self.command();
        cmd.args(["run", "--rm"]);
        if let Some(network) = &job.network {
            cmd.arg("--network").arg(network);
        }
        if let Some(workdir) = &job.workdir {
            cmd.arg("-w").arg(workdir);
        }
        // Values travel through the client's environment, not its argv
        for (key, value) in &job.env {
            cmd.arg("-e").arg(key).env(key, value);
        }
        for mount in &job.mounts {
            cmd.arg("-v").arg(mount);
        }
        cmd.arg(&job.image).args(&job.command);
        self.run("migrate", &mut cmd, self.timeouts.migration)
    }

    fn deploy_stack(&self, stack: &str, stack_file: &Path) -> Result<StageResult, DeployError> {
        info!("Deploying stack {} from {}", stack, stack_file.display());
        let mut cmd = self.command();
        cmd.args(["stack", "deploy", "--with-registry-auth", "-c"])
            .arg(stack_file)
            .arg(stack);
        self.run("rollout", &mut cmd, self.timeouts.orchestrator)
    }

    fn replica_counts(&self, stack: &str) -> Result<BTreeMap<String, ReplicaCount>, DeployError> {
        let mut cmd = self.command();
        cmd.args(["service", "ls", "--format", "{{.Name}} {{.Replicas}}", "--filter"])
            .arg(format!("name={}_", stack));
        let output = shell::run(&mut cmd, self.timeouts.orchestrator)?;
        if !output.success() {
            return Err(DeployError::InfrastructureError(format!(
                "docker service ls failed: {}",
                output.combined().trim()
            )));
        }
        Ok(parse_service_ls(stack, &output.stdout))
    }
}

/// Parse `docker service ls --format '{{.Name}} {{.Replicas}}'` lines such
/// as `shop_web 2/3` or `shop_scheduler 1/1 (max 1 per node)`
pub fn parse_service_ls(stack: &str, text: &str) -> BTreeMap<String, ReplicaCount> {
    let prefix = format!("{}_", stack);
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?.strip_prefix(&prefix)?;
            let (running, desired) = parts.next()?.split_once('/')?;
            Some((
                name.to_string(),
                ReplicaCount {
                    running: running.parse().ok()?,
                    desired: desired.parse().ok()?,
                },
            ))
        })
        .collect()
}
