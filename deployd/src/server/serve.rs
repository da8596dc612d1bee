//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::DeployError;
use crate::server::handlers::{
    create_handler, delete_handler, get_handler, health_handler, history_handler, list_handler,
    rollback_handler, trigger_handler, version_handler, webhook_handler,
};
use crate::server::state::ServerState;
use crate::server::stream::stream_handler;

/// Build the router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Inbound events and the live stream
        .route("/deployments/webhook/{id}", post(webhook_handler))
        .route("/deployments/ws/{id}", get(stream_handler))
        // Operator API
        .route("/deployments", get(list_handler).post(create_handler))
        .route("/deployments/{id}", get(get_handler).delete(delete_handler))
        .route("/deployments/{id}/trigger", post(trigger_handler))
        .route("/deployments/{id}/rollback", post(rollback_handler))
        .route("/deployments/{id}/history", get(history_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), DeployError>>, DeployError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DeployError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DeployError::ServerError(e.to_string()))
    });

    Ok(handle)
}
