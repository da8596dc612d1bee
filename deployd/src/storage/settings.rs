//! Settings file management

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Default settings file location
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/deployd/settings.json";

/// Daemon settings
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Directory for rotated log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// State directory (deployments, history, locks, stacks)
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default)]
    pub server: ServerSettings,

    /// Upper bound on concurrent blocking pipeline workers
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Registry images are published to
    #[serde(default = "default_registry")]
    pub registry: String,

    /// Overlay network shared by all roles
    #[serde(default = "default_overlay_network")]
    pub overlay_network: String,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// How long to wait for the source directory lock
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,

    /// Idle interval before the stream sends a heartbeat
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default)]
    pub notifications: NotificationSettings,

    #[serde(default)]
    pub auth: AuthSettings,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/deployd")
}

fn default_worker_threads() -> usize {
    4
}

fn default_registry() -> String {
    "127.0.0.1:5001".to_string()
}

fn default_overlay_network() -> String {
    "app-net".to_string()
}

fn default_lock_wait_secs() -> u64 {
    120
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            storage_dir: default_storage_dir(),
            server: ServerSettings::default(),
            worker_threads: default_worker_threads(),
            registry: default_registry(),
            overlay_network: default_overlay_network(),
            health: HealthSettings::default(),
            timeouts: TimeoutSettings::default(),
            lock_wait_secs: default_lock_wait_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            notifications: NotificationSettings::default(),
            auth: AuthSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub async fn load(file: &File) -> Result<Self, DeployError> {
        if !file.exists().await {
            warn!(
                "Settings file {} not found, using defaults",
                file.path().display()
            );
            return Ok(Self::default());
        }
        let text = file.read_string().await?;
        Self::parse(file.path(), &text)
    }

    /// [`Settings::load`] for callers without a runtime yet
    pub fn load_blocking(path: &Path) -> Result<Self, DeployError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(path, &text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(DeployError::ConfigError(format!("{}: {}", path.display(), e))),
        }
    }

    fn parse(path: &Path, text: &str) -> Result<Self, DeployError> {
        serde_json::from_str(text)
            .map_err(|e| DeployError::ConfigError(format!("{}: {}", path.display(), e)))
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
        }
    }
}

/// Rollout health polling
#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_attempts")]
    pub attempts: u32,

    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
}

fn default_health_attempts() -> u32 {
    12
}

fn default_health_interval_secs() -> u64 {
    5
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            attempts: default_health_attempts(),
            interval_secs: default_health_interval_secs(),
        }
    }
}

/// External command timeouts, in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_git_secs")]
    pub git_secs: u64,

    #[serde(default = "default_post_deploy_secs")]
    pub post_deploy_secs: u64,

    #[serde(default = "default_build_secs")]
    pub build_secs: u64,

    #[serde(default = "default_push_secs")]
    pub push_secs: u64,

    #[serde(default = "default_migration_secs")]
    pub migration_secs: u64,

    #[serde(default = "default_orchestrator_secs")]
    pub orchestrator_secs: u64,
}

fn default_git_secs() -> u64 {
    300
}

fn default_post_deploy_secs() -> u64 {
    600
}

fn default_build_secs() -> u64 {
    1800
}

fn default_push_secs() -> u64 {
    600
}

fn default_migration_secs() -> u64 {
    600
}

fn default_orchestrator_secs() -> u64 {
    120
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            git_secs: default_git_secs(),
            post_deploy_secs: default_post_deploy_secs(),
            build_secs: default_build_secs(),
            push_secs: default_push_secs(),
            migration_secs: default_migration_secs(),
            orchestrator_secs: default_orchestrator_secs(),
        }
    }
}

/// Completion mail settings
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSettings {
    /// Also notify `alert_recipient` about every run
    #[serde(default)]
    pub alerts_enabled: bool,

    #[serde(default)]
    pub alert_recipient: Option<String>,

    #[serde(default = "default_from_address")]
    pub from_address: String,

    #[serde(default = "default_sendmail_path")]
    pub sendmail_path: PathBuf,

    /// Log lines quoted at the end of the mail
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

fn default_from_address() -> String {
    "deployd@localhost".to_string()
}

fn default_sendmail_path() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}

fn default_log_tail_lines() -> usize {
    40
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            alerts_enabled: false,
            alert_recipient: None,
            from_address: default_from_address(),
            sendmail_path: default_sendmail_path(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

/// Operator token verification
#[derive(Debug, Default, Deserialize)]
pub struct AuthSettings {
    /// HS256 signing secret of operator tokens; without it every
    /// authenticated endpoint rejects
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub jwt_secret: Option<SecretString>,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}
