//! Notification dispatcher

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::models::deployment::Deployment;
use crate::notify::mailer::{MailMessage, MailTransport};
use crate::utils::tail_lines;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct NotifyOptions {
    pub alerts_enabled: bool,
    pub alert_recipient: Option<String>,
    pub from_address: String,
    pub log_tail_lines: usize,
}

impl Default for NotifyOptions {
    fn default() -> Self {
        Self {
            alerts_enabled: false,
            alert_recipient: None,
            from_address: "deployd@localhost".to_string(),
            log_tail_lines: 40,
        }
    }
}

/// Sends completion summaries; delivery problems are only logged
pub struct NotificationDispatcher {
    options: NotifyOptions,
    transport: Arc<dyn MailTransport>,
}

impl NotificationDispatcher {
    pub fn new(options: NotifyOptions, transport: Arc<dyn MailTransport>) -> Self {
        Self { options, transport }
    }

    /// The deployment's recipients plus the alert recipient, deduplicated
    /// case-insensitively in first-seen order
    pub fn recipients(&self, deployment: &Deployment) -> Vec<String> {
        let mut recipients: Vec<String> = Vec::new();
        let alert = self
            .options
            .alert_recipient
            .as_deref()
            .map(str::trim)
            .filter(|r| self.options.alerts_enabled && !r.is_empty())
            .map(str::to_string);

        for candidate in deployment.recipients().into_iter().chain(alert) {
            if !recipients.iter().any(|r| r.eq_ignore_ascii_case(&candidate)) {
                recipients.push(candidate);
            }
        }
        recipients
    }

    pub fn compose(&self, deployment: &Deployment, recipients: Vec<String>) -> MailMessage {
        let status = deployment.status.as_str().to_uppercase();
        let branch = if deployment.branch.trim().is_empty() {
            "(any)"
        } else {
            deployment.branch.as_str()
        };
        let body = format!(
            "Deployment: {}\nStatus: {}\nBranch: {}\nCommit: {}\nFinished: {}\n\nLast {} log lines:\n\n{}\n",
            deployment.name,
            status,
            branch,
            deployment.last_commit.as_deref().unwrap_or("unknown"),
            deployment
                .last_deployed_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string()),
            self.options.log_tail_lines,
            tail_lines(&deployment.logs, self.options.log_tail_lines),
        );
        MailMessage {
            from: self.options.from_address.clone(),
            to: recipients,
            subject: format!("[deployd] {} deployment {}", deployment.name, status),
            body,
        }
    }

    /// Send the summary for a finished run
    pub async fn notify(&self, deployment: &Deployment) -> Result<(), DeployError> {
        let recipients = self.recipients(deployment);
        if recipients.is_empty() {
            debug!("No recipients for {}, skipping notification", deployment.id);
            return Ok(());
        }
        let message = self.compose(deployment, recipients);
        self.transport.send(&message).await?;
        info!("Notified {} about {}", message.to.join(", "), deployment.id);
        Ok(())
    }

    /// Fire-and-forget [`Self::notify`]
    pub fn dispatch(self: &Arc<Self>, deployment: Deployment) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.notify(&deployment).await {
                warn!("Notification for {} failed: {}", deployment.id, e);
            }
        });
    }
}
