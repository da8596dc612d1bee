//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::{AppState, Collaborators};
use crate::errors::DeployError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::coordinator::{self, RunMessage};

/// Run the daemon until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    collaborators: Collaborators,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DeployError> {
    info!("Initializing deployd...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, collaborators, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start deployd: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    collaborators: Collaborators,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), DeployError> {
    let (app_state, messages) = AppState::init(options, collaborators).await?;
    let app_state = Arc::new(app_state);

    init_coordinator_loop(
        app_state.clone(),
        messages,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    Ok(())
}

fn init_coordinator_loop(
    app_state: Arc<AppState>,
    messages: mpsc::UnboundedReceiver<RunMessage>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing coordinator loop...");

    let coordinator = app_state.coordinator.clone();
    let handle = tokio::spawn(async move {
        coordinator::run(
            coordinator,
            messages,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_coordinator_handle(handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(
        app_state.coordinator.clone(),
        app_state.verifier.clone(),
        options.heartbeat,
    );

    let handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    coordinator_handle: Option<JoinHandle<()>>,
    server_handle: Option<JoinHandle<Result<(), DeployError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            coordinator_handle: None,
            server_handle: None,
        }
    }

    pub fn with_coordinator_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployError> {
        if self.coordinator_handle.is_some() {
            return Err(DeployError::ShutdownError("coordinator_handle already set".to_string()));
        }
        self.coordinator_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), DeployError>>,
    ) -> Result<(), DeployError> {
        if self.server_handle.is_some() {
            return Err(DeployError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), DeployError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DeployError> {
        info!("Shutting down deployd...");

        // 1. Server stops accepting triggers and closes streams
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))??;
        }

        // 2. Coordinator loop; runs still in flight are failed on next start
        if let Some(handle) = self.coordinator_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
