//! Deployment models

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::utils::{generate_uuid, mint_secret};

/// Deployment status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Never run
    #[default]
    Idle,

    /// A pipeline run is in flight
    Running,

    /// Last run succeeded
    Success,

    /// Last run failed
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Idle => "idle",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Success | DeploymentStatus::Failed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a deployment is rolled out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    /// Pull in place, run a post-deploy command, restart a supervised process
    #[default]
    SingleProcess,

    /// Build and publish an image, migrate, rolling-update a swarm stack
    Swarm,
}

/// Webhook HMAC secret. Minted once at creation, never rotated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookSecret(String);

impl WebhookSecret {
    pub fn mint() -> Self {
        Self(mint_secret())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WebhookSecret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret([REDACTED])")
    }
}

/// Swarm rollout parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutSettings {
    /// Replicas of the `web` role
    #[serde(default = "default_web_replicas")]
    pub web_replicas: u32,

    /// Replicas of the `worker` role; 0 disables the role
    #[serde(default)]
    pub worker_replicas: u32,

    /// Emit the single-replica `scheduler` role
    #[serde(default)]
    pub scheduler_enabled: bool,

    /// Emit the single-replica `monitor` role
    #[serde(default)]
    pub monitor_enabled: bool,

    /// Port the `web` role listens on (published and TCP-probed)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Build file, relative to the source directory
    #[serde(default = "default_dockerfile")]
    pub dockerfile_path: String,

    /// Application directory inside the image; config files mount here
    #[serde(default = "default_app_dir")]
    pub app_dir: String,

    #[serde(default)]
    pub web_command: Option<Vec<String>>,

    #[serde(default)]
    pub worker_command: Option<Vec<String>>,

    #[serde(default)]
    pub scheduler_command: Option<Vec<String>>,

    #[serde(default)]
    pub monitor_command: Option<Vec<String>>,

    /// One-shot migration run in a throwaway container before rollout
    #[serde(default)]
    pub migration_command: Option<Vec<String>>,
}

fn default_web_replicas() -> u32 {
    1
}

fn default_port() -> u16 {
    8080
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_app_dir() -> String {
    "/usr/src/app".to_string()
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            web_replicas: default_web_replicas(),
            worker_replicas: 0,
            scheduler_enabled: false,
            monitor_enabled: false,
            port: default_port(),
            dockerfile_path: default_dockerfile(),
            app_dir: default_app_dir(),
            web_command: None,
            worker_command: None,
            scheduler_command: None,
            monitor_command: None,
            migration_command: None,
        }
    }
}

/// A persisted deployment target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,

    /// Working copy on this host
    pub project_path: PathBuf,

    /// Branch to deploy; empty accepts pushes to any branch
    pub branch: String,

    pub secret: WebhookSecret,

    #[serde(default)]
    pub mode: DeploymentMode,

    /// Supervised process restarted after a single-process deploy
    #[serde(default)]
    pub supervisor_process: Option<String>,

    /// Shell command run in the working copy after the fetch
    #[serde(default)]
    pub post_deploy_command: Option<String>,

    /// Account for the post-deploy command; defaults to the working copy owner
    #[serde(default)]
    pub run_as: Option<String>,

    /// Comma-separated completion mail recipients
    #[serde(default)]
    pub notification_emails: Option<String>,

    #[serde(default)]
    pub rollout: RolloutSettings,

    #[serde(default)]
    pub status: DeploymentStatus,

    #[serde(default)]
    pub last_commit: Option<String>,

    #[serde(default)]
    pub last_image: Option<String>,

    /// Cumulative log of the latest run
    #[serde(default)]
    pub logs: String,

    #[serde(default)]
    pub deploy_count: u64,

    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Deployment {
    /// Build a new idle deployment with a freshly minted secret
    pub fn new(create: DeploymentCreate) -> Self {
        Self {
            id: generate_uuid(),
            name: create.name,
            project_path: create.project_path,
            branch: create.branch,
            secret: WebhookSecret::mint(),
            mode: create.mode,
            supervisor_process: create.supervisor_process.filter(|s| !s.trim().is_empty()),
            post_deploy_command: create.post_deploy_command.filter(|s| !s.trim().is_empty()),
            run_as: create.run_as.filter(|s| !s.trim().is_empty()),
            notification_emails: create.notification_emails,
            rollout: create.rollout,
            status: DeploymentStatus::Idle,
            last_commit: None,
            last_image: None,
            logs: String::new(),
            deploy_count: 0,
            last_deployed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Git ref a push must carry to trigger this deployment
    pub fn expected_ref(&self) -> Option<String> {
        let branch = self.branch.trim();
        if branch.is_empty() {
            None
        } else {
            Some(format!("refs/heads/{}", branch))
        }
    }

    /// Stack and image name derived from the deployment name
    pub fn stack_name(&self) -> String {
        let safe: String = self
            .name
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        let safe = safe.trim_matches('-').to_string();
        if safe.is_empty() {
            format!("deploy-{}", &self.id[..self.id.len().min(8)])
        } else {
            safe
        }
    }

    /// The per-deployment recipient list, trimmed, empty entries dropped
    pub fn recipients(&self) -> Vec<String> {
        self.notification_emails
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Administrative create request
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentCreate {
    pub name: String,
    pub project_path: PathBuf,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub mode: DeploymentMode,
    #[serde(default)]
    pub supervisor_process: Option<String>,
    #[serde(default)]
    pub post_deploy_command: Option<String>,
    #[serde(default)]
    pub run_as: Option<String>,
    #[serde(default)]
    pub notification_emails: Option<String>,
    #[serde(default)]
    pub rollout: RolloutSettings,
}

fn default_branch() -> String {
    "main".to_string()
}

impl DeploymentCreate {
    /// Reject requests that cannot be deployed or would leak into mail
    /// headers and command lines
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.name.trim().is_empty() {
            return Err(DeployError::ValidationError("name is required".to_string()));
        }
        if !self.project_path.is_absolute() {
            return Err(DeployError::ValidationError(
                "project_path must be absolute".to_string(),
            ));
        }
        let fields = [
            ("name", Some(self.name.as_str())),
            ("branch", Some(self.branch.as_str())),
            ("supervisor_process", self.supervisor_process.as_deref()),
            ("run_as", self.run_as.as_deref()),
            ("notification_emails", self.notification_emails.as_deref()),
        ];
        for (field, value) in fields {
            if value.is_some_and(|v| v.chars().any(char::is_control)) {
                return Err(DeployError::ValidationError(format!(
                    "{} must not contain control characters",
                    field
                )));
            }
        }
        Ok(())
    }
}

/// Deployment as returned to operators, with its webhook URL
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentView {
    #[serde(flatten)]
    pub deployment: Deployment,
    pub webhook_url: String,
}

impl DeploymentView {
    pub fn new(deployment: Deployment) -> Self {
        let webhook_url = format!("/deployments/webhook/{}", deployment.id);
        Self {
            deployment,
            webhook_url,
        }
    }
}

/// What a pipeline run does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunKind {
    /// Full pipeline for the deployment's mode
    Deploy,

    /// Re-submit the stack with a previously published image
    Rollback { image_tag: String },
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Deploy => "deploy",
            RunKind::Rollback { .. } => "rollback",
        }
    }
}
