//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::DeployError;
use crate::models::deployment::{Deployment, DeploymentCreate, DeploymentView, RunKind};
use crate::models::history::HistoryEntry;
use crate::server::state::ServerState;
use crate::utils::version_info;
use crate::webhook::{WebhookResponse, EVENT_HEADER, SIGNATURE_HEADER};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deployd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Signed source-control webhook
pub async fn webhook_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, DeployError> {
    let response = state
        .gateway
        .handle(
            &id,
            header_str(&headers, SIGNATURE_HEADER),
            header_str(&headers, EVENT_HEADER),
            &body,
        )
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueuedResponse {
    pub status: String,
}

impl QueuedResponse {
    fn queued() -> Self {
        Self {
            status: "deployment_queued".to_string(),
        }
    }
}

/// Manual trigger, no signature involved
pub async fn trigger_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<QueuedResponse>, DeployError> {
    let claims = state.authorize(&headers)?;
    state.coordinator.trigger(&id, RunKind::Deploy).await?;
    info!("{} triggered deployment {}", claims.sub, id);
    Ok(Json(QueuedResponse::queued()))
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub image_tag: String,
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<QueuedResponse>, DeployError> {
    let claims = state.authorize(&headers)?;
    let request: RollbackRequest = serde_json::from_slice(&body)?;
    let image_tag = request.image_tag.trim().to_string();
    if image_tag.is_empty() {
        return Err(DeployError::ValidationError("image_tag is required".to_string()));
    }
    state
        .coordinator
        .trigger(&id, RunKind::Rollback { image_tag: image_tag.clone() })
        .await?;
    info!("{} rolled {} back to {}", claims.sub, id, image_tag);
    Ok(Json(QueuedResponse::queued()))
}

pub async fn list_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeploymentView>>, DeployError> {
    state.authorize(&headers)?;
    let deployments = state.coordinator.store().list().await?;
    Ok(Json(deployments.into_iter().map(DeploymentView::new).collect()))
}

pub async fn create_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<DeploymentView>), DeployError> {
    let claims = state.authorize(&headers)?;
    let create: DeploymentCreate = serde_json::from_slice(&body)?;
    create.validate()?;

    let deployment = Deployment::new(create);
    let stack = deployment.stack_name();
    let _guard = state.create_lock.lock().await;
    let existing = state.coordinator.store().list().await?;
    if let Some(other) = existing.iter().find(|d| d.stack_name() == stack) {
        return Err(DeployError::ValidationError(format!(
            "stack name `{}` is already used by deployment {}",
            stack, other.id
        )));
    }
    state.coordinator.store().insert(&deployment).await?;
    info!("{} created deployment {} ({})", claims.sub, deployment.name, deployment.id);
    Ok((StatusCode::CREATED, Json(DeploymentView::new(deployment))))
}

pub async fn get_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeploymentView>, DeployError> {
    state.authorize(&headers)?;
    let deployment = state
        .coordinator
        .store()
        .get(&id)
        .await?
        .ok_or_else(|| DeployError::NotFound(format!("deployment {}", id)))?;
    Ok(Json(DeploymentView::new(deployment)))
}

pub async fn delete_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, DeployError> {
    state.authorize(&headers)?;
    if state.coordinator.delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(DeployError::NotFound(format!("deployment {}", id)))
    }
}

pub async fn history_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<HistoryEntry>>, DeployError> {
    state.authorize(&headers)?;
    if state.coordinator.store().get(&id).await?.is_none() {
        return Err(DeployError::NotFound(format!("deployment {}", id)));
    }
    Ok(Json(state.coordinator.history().list(&id).await?))
}
