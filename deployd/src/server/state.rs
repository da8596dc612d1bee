//! Server state

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use tokio::sync::Mutex;

use crate::authn::token::{Claims, TokenVerifier};
use crate::errors::DeployError;
use crate::webhook::WebhookGateway;
use crate::workers::coordinator::Coordinator;

/// Server state shared across handlers
pub struct ServerState {
    pub coordinator: Arc<Coordinator>,
    pub gateway: Arc<WebhookGateway>,
    pub verifier: Arc<TokenVerifier>,

    /// Idle time before the stream sends a heartbeat
    pub heartbeat: Duration,

    /// Held across the stack name check and the insert of a create
    pub create_lock: Mutex<()>,
}

impl ServerState {
    pub fn new(
        coordinator: Arc<Coordinator>,
        verifier: Arc<TokenVerifier>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            gateway: Arc::new(WebhookGateway::new(coordinator.clone())),
            coordinator,
            verifier,
            heartbeat,
            create_lock: Mutex::new(()),
        }
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<Claims, DeployError> {
        self.verifier.verify_headers(headers)
    }
}
