//! Swarm stack composition
//!
//! [`compose`] maps a deployment's rollout settings, an image reference and
//! the resolved environment to a stack file with up to four roles:
//!
//! - `web`: always present, rolled one task at a time, new before old, rolled
//!   back automatically when a new task never turns healthy
//! - `worker`: stop-first with a long grace period for in-flight jobs
//! - `scheduler`: exactly one replica
//! - `monitor`: exactly one replica
//!
//! Every role shares the environment, the external overlay network, one named
//! storage volume and the read-only configuration mounts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::DeployError;
use crate::models::deployment::{Deployment, RolloutSettings};

pub const ROLE_WEB: &str = "web";
pub const ROLE_WORKER: &str = "worker";
pub const ROLE_SCHEDULER: &str = "scheduler";
pub const ROLE_MONITOR: &str = "monitor";

const STORAGE_VOLUME: &str = "storage";
const WORKER_GRACE_PERIOD: &str = "60s";

/// Top-level stack file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFile {
    pub version: String,
    pub services: BTreeMap<String, ServiceSpec>,
    pub networks: BTreeMap<String, NetworkSpec>,
    pub volumes: BTreeMap<String, VolumeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    pub networks: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<String>,

    pub deploy: DeploySpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthcheckSpec {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
    pub start_period: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploySpec {
    pub replicas: u32,
    pub update_config: UpdateConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_config: Option<UpdateConfig>,

    pub restart_policy: RestartPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    pub parallelism: u32,

    /// `start-first` or `stop-first`
    pub order: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub external: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {}

impl StackFile {
    /// Desired replica count per role
    pub fn desired_replicas(&self) -> BTreeMap<String, u32> {
        self.services
            .iter()
            .map(|(role, service)| (role.clone(), service.deploy.replicas))
            .collect()
    }

    pub fn to_yaml(&self) -> Result<String, DeployError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Environment and configuration files shared by every role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackContext {
    pub env: BTreeMap<String, String>,

    /// Host paths of files mounted read-only under the application directory
    pub config_files: Vec<PathBuf>,
}

impl StackContext {
    /// Read `.env` and discover configuration files in the source directory
    pub fn resolve(source: &Path, rollout: &RolloutSettings) -> Result<Self, DeployError> {
        let env_path = source.join(".env");
        let mut env = match fs::read_to_string(&env_path) {
            Ok(text) => parse_env_file(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        let port = rollout.port.to_string();
        env.insert("PORT".to_string(), port.clone());
        env.insert("APP_PORT".to_string(), port);

        Ok(Self {
            env,
            config_files: discover_config_files(source)?,
        })
    }

    /// `host:container:ro` bind mounts under `app_dir`
    pub fn mounts(&self, app_dir: &str) -> Vec<String> {
        let app_dir = app_dir.trim_end_matches('/');
        self.config_files
            .iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_string_lossy();
                Some(format!("{}:{}/{}:ro", path.display(), app_dir, name))
            })
            .collect()
    }
}

/// Parse `KEY=VALUE` lines, skipping blanks and `#` comments, stripping an
/// optional `export ` prefix and one level of matching quotes
pub fn parse_env_file(text: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = ['"', '\'']
            .iter()
            .find_map(|q| {
                value
                    .strip_prefix(*q)
                    .and_then(|v| v.strip_suffix(*q))
            })
            .unwrap_or(value);
        env.insert(key.to_string(), value.to_string());
    }
    env
}

/// Top-level `.env`, `*.json`, `*.pem` and `*.xml` files, sorted
pub fn discover_config_files(source: &Path) -> Result<Vec<PathBuf>, DeployError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let is_config = path.file_name().and_then(|n| n.to_str()) == Some(".env")
            || matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("json" | "pem" | "xml")
            );
        if is_config {
            files.push(path);
        }
    }
    files.sort();
    debug!("Discovered {} config files in {}", files.len(), source.display());
    Ok(files)
}

/// Build the stack topology for `deployment` running `image`
pub fn compose(
    deployment: &Deployment,
    image: &str,
    context: &StackContext,
    network: &str,
) -> StackFile {
    let rollout = &deployment.rollout;
    let mut volumes = vec![format!(
        "{}:{}/storage",
        STORAGE_VOLUME,
        rollout.app_dir.trim_end_matches('/')
    )];
    volumes.extend(context.mounts(&rollout.app_dir));

    let base = |command: &Option<Vec<String>>, replicas: u32, update_config: UpdateConfig| {
        ServiceSpec {
            image: image.to_string(),
            command: command.clone(),
            environment: context.env.clone(),
            networks: vec![network.to_string()],
            volumes: volumes.clone(),
            ports: Vec::new(),
            healthcheck: None,
            stop_grace_period: None,
            deploy: DeploySpec {
                replicas,
                update_config,
                rollback_config: None,
                restart_policy: RestartPolicy {
                    condition: "any".to_string(),
                },
            },
        }
    };

    let mut services = BTreeMap::new();

    let mut web = base(
        &rollout.web_command,
        rollout.web_replicas.max(1),
        UpdateConfig {
            parallelism: 1,
            order: "start-first".to_string(),
            failure_action: Some("rollback".to_string()),
            delay: Some("10s".to_string()),
            monitor: Some("30s".to_string()),
        },
    );
    web.ports = vec![format!("{}:{}", rollout.port, rollout.port)];
    web.healthcheck = Some(HealthcheckSpec {
        test: vec![
            "CMD-SHELL".to_string(),
            format!("nc -z 127.0.0.1 {} || exit 1", rollout.port),
        ],
        interval: "10s".to_string(),
        timeout: "5s".to_string(),
        retries: 3,
        start_period: "30s".to_string(),
    });
    web.deploy.rollback_config = Some(UpdateConfig {
        parallelism: 1,
        order: "start-first".to_string(),
        failure_action: None,
        delay: None,
        monitor: None,
    });
    services.insert(ROLE_WEB.to_string(), web);

    if rollout.worker_replicas > 0 {
        let mut worker = base(
            &rollout.worker_command,
            rollout.worker_replicas,
            UpdateConfig {
                parallelism: 1,
                order: "stop-first".to_string(),
                failure_action: Some("pause".to_string()),
                delay: None,
                monitor: None,
            },
        );
        worker.stop_grace_period = Some(WORKER_GRACE_PERIOD.to_string());
        services.insert(ROLE_WORKER.to_string(), worker);
    }

    let single = || UpdateConfig {
        parallelism: 1,
        order: "stop-first".to_string(),
        failure_action: None,
        delay: None,
        monitor: None,
    };
    if rollout.scheduler_enabled {
        services.insert(
            ROLE_SCHEDULER.to_string(),
            base(&rollout.scheduler_command, 1, single()),
        );
    }
    if rollout.monitor_enabled {
        services.insert(
            ROLE_MONITOR.to_string(),
            base(&rollout.monitor_command, 1, single()),
        );
    }

    StackFile {
        version: "3.8".to_string(),
        services,
        networks: BTreeMap::from([(network.to_string(), NetworkSpec { external: true })]),
        volumes: BTreeMap::from([(STORAGE_VOLUME.to_string(), VolumeSpec::default())]),
    }
}
