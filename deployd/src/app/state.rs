//! Application state management

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::app::options::AppOptions;
use crate::authn::token::TokenVerifier;
use crate::deploy::docker::{ContainerRuntime, DockerCli};
use crate::deploy::executor::PipelineExecutor;
use crate::deploy::git::{GitCli, Vcs};
use crate::deploy::supervisor::{Supervisor, SupervisorCtl};
use crate::errors::DeployError;
use crate::notify::dispatcher::NotificationDispatcher;
use crate::notify::mailer::{MailTransport, SendmailTransport};
use crate::storage::history::HistoryStore;
use crate::storage::store::{DeploymentStore, FileDeploymentStore};
use crate::stream::broadcaster::LogBroadcaster;
use crate::workers::coordinator::{Coordinator, RunMessage};

/// External collaborators the pipeline and notifier talk to
pub struct Collaborators {
    pub vcs: Arc<dyn Vcs>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub supervisor: Arc<dyn Supervisor>,
    pub mail: Arc<dyn MailTransport>,
}

impl Collaborators {
    /// Command line clients configured from the options
    pub fn system(options: &AppOptions) -> Self {
        Self {
            vcs: Arc::new(GitCli {
                timeout: options.pipeline.git_timeout,
            }),
            runtime: Arc::new(DockerCli {
                timeouts: options.pipeline.docker.clone(),
                ..Default::default()
            }),
            supervisor: Arc::new(SupervisorCtl {
                timeout: options.pipeline.supervisor_timeout,
                ..Default::default()
            }),
            mail: Arc::new(SendmailTransport {
                program: options.sendmail_path.clone(),
            }),
        }
    }
}

/// Main application state
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub verifier: Arc<TokenVerifier>,
}

impl AppState {
    /// Initialize application state. The returned receiver carries worker
    /// messages and must be handed to the coordinator loop.
    pub async fn init(
        options: &AppOptions,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RunMessage>), DeployError> {
        info!("Initializing application state...");

        options.layout.setup().await?;

        let store: Arc<dyn DeploymentStore> =
            Arc::new(FileDeploymentStore::new(options.layout.deployments_dir()));
        let history = Arc::new(HistoryStore::new(options.layout.history_dir()));
        let broadcaster = Arc::new(LogBroadcaster::new());
        let notifier = Arc::new(NotificationDispatcher::new(
            options.notify.clone(),
            collaborators.mail,
        ));
        let executor = Arc::new(PipelineExecutor::new(
            options.pipeline.executor.clone(),
            collaborators.vcs,
            collaborators.runtime,
            collaborators.supervisor,
        ));

        let (coordinator, messages) =
            Coordinator::new(store, history, broadcaster, notifier, executor);

        let recovered = coordinator.recover_interrupted().await?;
        if recovered > 0 {
            info!("Recovered {} interrupted run(s)", recovered);
        }

        let verifier = Arc::new(TokenVerifier::new(options.jwt_secret.as_deref()));

        Ok((
            Self {
                coordinator,
                verifier,
            },
            messages,
        ))
    }
}
