//! Pipeline executor
//!
//! Runs every stage of a deployment on the calling (blocking) thread and
//! reports the cumulative log after each step through a callback. Stage
//! output is appended verbatim under a `==> [phase] description` banner; the
//! first hard failure aborts the remaining stages.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::deploy::compose::{compose, StackContext};
use crate::deploy::docker::{ContainerRuntime, OneShot};
use crate::deploy::git::Vcs;
use crate::deploy::health::{format_counts, HealthPoller};
use crate::deploy::lock::SourceLock;
use crate::deploy::privilege::RunIdentity;
use crate::deploy::shell;
use crate::deploy::stage::StageResult;
use crate::deploy::supervisor::Supervisor;
use crate::errors::DeployError;
use crate::models::deployment::{Deployment, DeploymentMode, RunKind};

const BANNER_PREFIX: &str = "==> [";

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Registry host images are tagged for
    pub registry: String,

    pub overlay_network: String,

    pub locks_dir: PathBuf,

    /// Where rendered stack files are written
    pub stacks_dir: PathBuf,

    pub lock_wait: Duration,

    pub post_deploy_timeout: Duration,

    pub health: HealthPoller,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            registry: "127.0.0.1:5001".to_string(),
            overlay_network: "app-net".to_string(),
            locks_dir: PathBuf::from("/var/lib/deployd/locks"),
            stacks_dir: PathBuf::from("/var/lib/deployd/stacks"),
            lock_wait: Duration::from_secs(120),
            post_deploy_timeout: Duration::from_secs(600),
            health: HealthPoller::default(),
        }
    }
}

/// Result of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub success: bool,
    pub log: String,
    pub commit_hash: Option<String>,
    /// Commit-tagged image rolled out, swarm mode only
    pub image_tag: Option<String>,
}

/// Phase named by the last banner of a run log
pub fn infer_phase(log: &str) -> Option<String> {
    log.lines().rev().find_map(|line| {
        line.strip_prefix(BANNER_PREFIX)
            .and_then(|rest| rest.split_once(']'))
            .map(|(phase, _)| phase.to_string())
    })
}

/// Cumulative run log that reports itself after every append
struct RunLog<'a> {
    text: String,
    sink: &'a mut dyn FnMut(&str),
}

impl<'a> RunLog<'a> {
    fn new(initial: &str, sink: &'a mut dyn FnMut(&str)) -> Self {
        let mut text = initial.to_string();
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        Self { text, sink }
    }

    fn banner(&mut self, phase: &str, description: impl AsRef<str>) {
        self.push(&format!("{}{}] {}\n", BANNER_PREFIX, phase, description.as_ref()));
    }

    fn line(&mut self, text: impl AsRef<str>) {
        self.push(&format!("{}\n", text.as_ref()));
    }

    fn stage(&mut self, result: &StageResult) {
        if result.output.is_empty() {
            return;
        }
        let mut text = result.output.clone();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.push(&text);
    }

    fn push(&mut self, text: &str) {
        self.text.push_str(text);
        (self.sink)(&self.text);
    }
}

/// Append a stage's output and turn an unsuccessful result into an error
fn check(log: &mut RunLog<'_>, result: Result<StageResult, DeployError>) -> Result<StageResult, DeployError> {
    let result = result?;
    log.stage(&result);
    if result.ok {
        Ok(result)
    } else {
        Err(DeployError::stage(&result.stage, "command exited unsuccessfully"))
    }
}

#[derive(Debug, Default)]
struct RunFacts {
    commit_hash: Option<String>,
    image_tag: Option<String>,
}

/// Runs deployment pipelines against the external collaborators
pub struct PipelineExecutor {
    options: ExecutorOptions,
    vcs: Arc<dyn Vcs>,
    runtime: Arc<dyn ContainerRuntime>,
    supervisor: Arc<dyn Supervisor>,
    sleep: Arc<dyn Fn(Duration) + Send + Sync>,
}

impl PipelineExecutor {
    pub fn new(
        options: ExecutorOptions,
        vcs: Arc<dyn Vcs>,
        runtime: Arc<dyn ContainerRuntime>,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        Self {
            options,
            vcs,
            runtime,
            supervisor,
            sleep: Arc::new(std::thread::sleep),
        }
    }

    /// Replace the sleep used between health attempts
    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Arc::new(sleep);
        self
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Execute a run to completion. Never returns an error: failures are
    /// folded into the outcome and its log.
    pub fn run(
        &self,
        deployment: &Deployment,
        kind: &RunKind,
        initial_log: &str,
        on_update: &mut dyn FnMut(&str),
    ) -> RunOutcome {
        let mut log = RunLog::new(initial_log, on_update);
        let mut facts = RunFacts::default();

        info!("Running {} of {} ({})", kind.as_str(), deployment.name, deployment.id);
        let result = match (deployment.mode, kind) {
            (DeploymentMode::SingleProcess, RunKind::Deploy) => {
                self.run_single_process(deployment, &mut log, &mut facts)
            }
            (DeploymentMode::Swarm, RunKind::Deploy) => {
                self.run_swarm(deployment, &mut log, &mut facts)
            }
            (DeploymentMode::Swarm, RunKind::Rollback { image_tag }) => {
                self.run_rollback(deployment, image_tag, &mut log, &mut facts)
            }
            (DeploymentMode::SingleProcess, RunKind::Rollback { .. }) => Err(
                DeployError::ValidationError("rollback requires swarm mode".to_string()),
            ),
        };

        let success = match result {
            Ok(()) => {
                log.banner("done", "Deployment finished successfully");
                true
            }
            Err(e) => {
                warn!("Run of {} failed: {}", deployment.id, e);
                log.line(format!("ERROR: {}", e));
                log.banner("failed", "Deployment failed");
                false
            }
        };

        RunOutcome {
            success,
            log: log.text,
            commit_hash: facts.commit_hash,
            image_tag: facts.image_tag,
        }
    }

    // ============================= SINGLE PROCESS ================================ //

    fn run_single_process(
        &self,
        deployment: &Deployment,
        log: &mut RunLog<'_>,
        facts: &mut RunFacts,
    ) -> Result<(), DeployError> {
        let _lock = self.lock_source(deployment, log)?;
        self.fetch(deployment, log)?;

        match self.vcs.current_commit(&deployment.project_path) {
            Ok(commit) => {
                log.line(format!("HEAD is now {}", commit));
                facts.commit_hash = Some(commit);
            }
            Err(e) => log.line(format!("WARNING: could not read commit hash: {}", e)),
        }

        if let Some(command) = &deployment.post_deploy_command {
            log.banner("post-deploy", format!("Running `{}`", command));
            let identity = RunIdentity::resolve(&deployment.project_path, deployment.run_as.as_deref())?;
            log.line(format!("as {} (uid {})", identity.name, identity.uid));

            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command).current_dir(&deployment.project_path);
            identity.apply(&mut cmd);
            let timeout = self.options.post_deploy_timeout;
            check(log, shell::run(&mut cmd, timeout).map(|o| o.into_stage("post-deploy", timeout)))?;
        }

        if let Some(process) = &deployment.supervisor_process {
            log.banner("restart", format!("Restarting {}", process));
            check(log, self.supervisor.restart(process))?;
        }

        Ok(())
    }

    // ================================= SWARM ===================================== //

    fn run_swarm(
        &self,
        deployment: &Deployment,
        log: &mut RunLog<'_>,
        facts: &mut RunFacts,
    ) -> Result<(), DeployError> {
        let repository = format!("{}/{}", self.options.registry, deployment.stack_name());

        // The working copy stays locked until the build has read it
        let (tagged, latest) = {
            let _lock = self.lock_source(deployment, log)?;
            self.fetch(deployment, log)?;

            let commit = self.vcs.current_commit(&deployment.project_path)?;
            log.line(format!("HEAD is now {}", commit));
            facts.commit_hash = Some(commit.clone());

            let tagged = format!("{}:{}", repository, commit);
            let latest = format!("{}:latest", repository);
            log.banner("build", format!("Building {}", tagged));
            check(
                log,
                self.runtime.build(
                    &deployment.project_path,
                    &deployment.rollout.dockerfile_path,
                    &[tagged.clone(), latest.clone()],
                ),
            )?;
            (tagged, latest)
        };

        for tag in [&tagged, &latest] {
            log.banner("publish", format!("Pushing {}", tag));
            if let Err(e) = check(log, self.runtime.push(tag)) {
                log.line(format!(
                    "Image {} is still available locally; push it manually or re-trigger",
                    tagged
                ));
                return Err(e);
            }
        }
        facts.image_tag = Some(tagged.clone());

        log.banner("network", format!("Ensuring overlay network {}", self.options.overlay_network));
        check(log, self.runtime.ensure_network(&self.options.overlay_network))?;

        let context = StackContext::resolve(&deployment.project_path, &deployment.rollout)?;

        match &deployment.rollout.migration_command {
            Some(command) if !command.is_empty() => {
                log.banner("migrate", format!("Running `{}`", command.join(" ")));
                let job = OneShot {
                    image: tagged.clone(),
                    command: command.clone(),
                    env: context.env.clone(),
                    mounts: context.mounts(&deployment.rollout.app_dir),
                    network: Some(self.options.overlay_network.clone()),
                    workdir: Some(deployment.rollout.app_dir.clone()),
                };
                check(log, self.runtime.run_oneshot(&job))?;
            }
            _ => log.banner("migrate", "No migration command configured, skipping"),
        }

        self.roll_out(deployment, &tagged, &context, log)
    }

    fn run_rollback(
        &self,
        deployment: &Deployment,
        image_tag: &str,
        log: &mut RunLog<'_>,
        facts: &mut RunFacts,
    ) -> Result<(), DeployError> {
        log.banner("rollback", format!("Rolling back to {}", image_tag));
        facts.image_tag = Some(image_tag.to_string());
        facts.commit_hash = image_tag.rsplit_once(':').map(|(_, commit)| commit.to_string());

        log.banner("network", format!("Ensuring overlay network {}", self.options.overlay_network));
        check(log, self.runtime.ensure_network(&self.options.overlay_network))?;

        let context = StackContext::resolve(&deployment.project_path, &deployment.rollout)?;
        self.roll_out(deployment, image_tag, &context, log)
    }

    /// Compose, submit and watch the stack. Unconverged replicas only warn.
    fn roll_out(
        &self,
        deployment: &Deployment,
        image: &str,
        context: &StackContext,
        log: &mut RunLog<'_>,
    ) -> Result<(), DeployError> {
        let stack = deployment.stack_name();
        let stack_file = compose(deployment, image, context, &self.options.overlay_network);
        let path = self.write_stack_file(&stack, &stack_file.to_yaml()?)?;

        log.banner("rollout", format!("Updating stack {} to {}", stack, image));
        check(log, self.runtime.deploy_stack(&stack, &path))?;

        let desired = stack_file.desired_replicas();
        let poller = &self.options.health;
        log.banner(
            "health",
            format!("Waiting for replicas ({} attempts, {}s apart)", poller.attempts, poller.interval.as_secs()),
        );

        let runtime = &self.runtime;
        let sleep = &self.sleep;
        let report = poller.poll(
            &desired,
            || {
                runtime
                    .replica_counts(&stack)
                    .map(|counts| counts.into_iter().map(|(role, c)| (role, c.running)).collect())
            },
            |interval| sleep(interval),
            |attempt, observed| {
                log.line(format!(
                    "attempt {}/{}: {}",
                    attempt,
                    poller.attempts.max(1),
                    format_counts(&desired, observed)
                ))
            },
        );

        if report.satisfied {
            log.line("All roles reached their desired replica count");
        } else {
            log.line(format!(
                "WARNING: replicas did not converge after {} attempts ({}); the orchestrator keeps rolling",
                report.attempts,
                format_counts(&desired, &report.observed)
            ));
        }
        Ok(())
    }

    // ================================= HELPERS =================================== //

    fn lock_source(&self, deployment: &Deployment, log: &mut RunLog<'_>) -> Result<SourceLock, DeployError> {
        let source = &deployment.project_path;
        if !source.is_dir() {
            return Err(DeployError::InfrastructureError(format!(
                "source directory {} does not exist",
                source.display()
            )));
        }
        log.banner("lock", format!("Locking {}", source.display()));
        let lock = SourceLock::acquire(&self.options.locks_dir, source, self.options.lock_wait)?;
        debug!("Holding {}", lock.path().display());
        Ok(lock)
    }

    fn fetch(&self, deployment: &Deployment, log: &mut RunLog<'_>) -> Result<(), DeployError> {
        let branch = deployment.branch.trim();
        log.banner(
            "fetch",
            if branch.is_empty() {
                "Pulling upstream".to_string()
            } else {
                format!("Pulling origin/{}", branch)
            },
        );
        check(log, self.vcs.pull(&deployment.project_path, branch))?;
        Ok(())
    }

    fn write_stack_file(&self, stack: &str, yaml: &str) -> Result<PathBuf, DeployError> {
        let dir: &Path = &self.options.stacks_dir;
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.yml", stack));
        let tmp = dir.join(format!("{}.yml.tmp", stack));
        fs::write(&tmp, yaml)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}
