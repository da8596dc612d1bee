//! Application configuration options

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::deploy::docker::DockerTimeouts;
use crate::deploy::executor::ExecutorOptions;
use crate::deploy::health::HealthPoller;
use crate::notify::dispatcher::NotifyOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Server configuration
    pub server: ServerOptions,

    pub pipeline: PipelineOptions,

    pub notify: NotifyOptions,

    pub sendmail_path: PathBuf,

    /// Operator token signing secret
    pub jwt_secret: Option<Arc<SecretString>>,

    /// Idle time before the stream sends a heartbeat
    pub heartbeat: Duration,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::default(),
            server: ServerOptions::default(),
            pipeline: PipelineOptions::default(),
            notify: NotifyOptions::default(),
            sendmail_path: PathBuf::from("/usr/sbin/sendmail"),
            jwt_secret: None,
            heartbeat: Duration::from_secs(30),
        }
    }
}

impl AppOptions {
    /// Resolve the settings file into runtime options
    pub fn from_settings(settings: Settings) -> Self {
        let layout = StorageLayout::new(settings.storage_dir.clone());
        let timeouts = &settings.timeouts;
        Self {
            lifecycle: LifecycleOptions::default(),
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            pipeline: PipelineOptions {
                executor: ExecutorOptions {
                    registry: settings.registry.clone(),
                    overlay_network: settings.overlay_network.clone(),
                    locks_dir: layout.locks_dir().path().to_path_buf(),
                    stacks_dir: layout.stacks_dir().path().to_path_buf(),
                    lock_wait: Duration::from_secs(settings.lock_wait_secs),
                    post_deploy_timeout: Duration::from_secs(timeouts.post_deploy_secs),
                    health: HealthPoller::new(
                        settings.health.attempts,
                        Duration::from_secs(settings.health.interval_secs),
                    ),
                },
                git_timeout: Duration::from_secs(timeouts.git_secs),
                docker: DockerTimeouts {
                    build: Duration::from_secs(timeouts.build_secs),
                    push: Duration::from_secs(timeouts.push_secs),
                    migration: Duration::from_secs(timeouts.migration_secs),
                    orchestrator: Duration::from_secs(timeouts.orchestrator_secs),
                },
                supervisor_timeout: Duration::from_secs(timeouts.orchestrator_secs),
            },
            notify: NotifyOptions {
                alerts_enabled: settings.notifications.alerts_enabled,
                alert_recipient: settings.notifications.alert_recipient.clone(),
                from_address: settings.notifications.from_address.clone(),
                log_tail_lines: settings.notifications.log_tail_lines,
            },
            sendmail_path: settings.notifications.sendmail_path.clone(),
            jwt_secret: settings.auth.jwt_secret.map(Arc::new),
            heartbeat: Duration::from_secs(settings.heartbeat_secs.max(1)),
            layout,
        }
    }
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Pipeline collaborator options
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub executor: ExecutorOptions,
    pub git_timeout: Duration,
    pub docker: DockerTimeouts,
    pub supervisor_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            executor: ExecutorOptions::default(),
            git_timeout: Duration::from_secs(300),
            docker: DockerTimeouts::default(),
            supervisor_timeout: Duration::from_secs(120),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}
