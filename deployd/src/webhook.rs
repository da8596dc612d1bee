//! Signed webhook intake

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::models::deployment::{Deployment, RunKind, WebhookSecret};
use crate::utils::hex;
use crate::workers::coordinator::Coordinator;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Ok,
    Ignored,
    DeploymentQueued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: WebhookStatus,
    pub message: String,
}

impl WebhookResponse {
    fn new(status: WebhookStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// What an authenticated event asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDecision {
    Ping,
    Ignore(String),
    Deploy,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

/// `sha256=<hex hmac>` of `body` under `secret`
pub fn sign(secret: &WebhookSecret, body: &[u8]) -> Result<String, DeployError> {
    let mut mac = HmacSha256::new_from_slice(secret.expose().as_bytes())
        .map_err(|e| DeployError::Internal(e.to_string()))?;
    mac.update(body);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check a signature header against the exact raw body in constant time
pub fn verify_signature(
    secret: &WebhookSecret,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), DeployError> {
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| DeployError::AuthError("missing signature".to_string()))?;
    let expected = header
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(hex::decode)
        .ok_or_else(|| DeployError::AuthError("malformed signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.expose().as_bytes())
        .map_err(|e| DeployError::Internal(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| DeployError::AuthError("signature mismatch".to_string()))
}

/// Decide what an authenticated event means for `deployment`
pub fn classify(
    deployment: &Deployment,
    event: Option<&str>,
    body: &[u8],
) -> Result<WebhookDecision, DeployError> {
    match event.map(str::trim) {
        Some("ping") => Ok(WebhookDecision::Ping),
        Some("push") => {
            let payload: PushPayload = serde_json::from_slice(body)
                .map_err(|e| DeployError::ValidationError(format!("invalid push payload: {}", e)))?;
            let received = payload.git_ref.unwrap_or_default();
            match deployment.expected_ref() {
                Some(expected) if expected != received => Ok(WebhookDecision::Ignore(format!(
                    "Push to {} ignored, expected {}",
                    if received.is_empty() { "(no ref)" } else { received.as_str() },
                    expected
                ))),
                _ => Ok(WebhookDecision::Deploy),
            }
        }
        Some(other) if !other.is_empty() => {
            Ok(WebhookDecision::Ignore(format!("Event {} ignored", other)))
        }
        _ => Ok(WebhookDecision::Ignore("Missing event type".to_string())),
    }
}

/// Verifies inbound events and hands accepted pushes to the coordinator
pub struct WebhookGateway {
    coordinator: Arc<Coordinator>,
}

impl WebhookGateway {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn handle(
        &self,
        id: &str,
        signature: Option<&str>,
        event: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookResponse, DeployError> {
        let deployment = self
            .coordinator
            .store()
            .get(id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("deployment {}", id)))?;

        verify_signature(&deployment.secret, body, signature)?;

        match classify(&deployment, event, body)? {
            WebhookDecision::Ping => Ok(WebhookResponse::new(
                WebhookStatus::Ok,
                "Webhook configured successfully",
            )),
            WebhookDecision::Ignore(reason) => {
                debug!("Webhook for {}: {}", id, reason);
                Ok(WebhookResponse::new(WebhookStatus::Ignored, reason))
            }
            WebhookDecision::Deploy => match self.coordinator.trigger(id, RunKind::Deploy).await {
                Ok(()) => {
                    info!("Webhook queued deployment {}", id);
                    Ok(WebhookResponse::new(
                        WebhookStatus::DeploymentQueued,
                        "Deployment queued",
                    ))
                }
                Err(DeployError::AlreadyRunning(_)) => Ok(WebhookResponse::new(
                    WebhookStatus::Ignored,
                    "A deployment is already running",
                )),
                Err(e) => Err(e),
            },
        }
    }
}
