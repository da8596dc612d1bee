//! Mail transport

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::DeployError;

/// Plain-text message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl MailMessage {
    /// RFC 5322 rendering with the recipients in the `To` header. Line
    /// breaks in header values are flattened so no header can be injected.
    pub fn render(&self) -> String {
        let to: Vec<String> = self.to.iter().map(|r| header_value(r)).collect();
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            header_value(&self.from),
            to.join(", "),
            header_value(&self.subject),
            self.body.replace('\n', "\r\n")
        )
    }
}

fn header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), DeployError>;
}

/// Delivers through the local `sendmail -t` binary
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    pub program: PathBuf,
}

#[async_trait]
impl MailTransport for SendmailTransport {
    async fn send(&self, message: &MailMessage) -> Result<(), DeployError> {
        debug!("Sending \"{}\" to {}", message.subject, message.to.join(", "));
        let mut child = Command::new(&self.program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                DeployError::NotificationError(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.render().as_bytes())
                .await
                .map_err(|e| DeployError::NotificationError(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DeployError::NotificationError(e.to_string()))?;
        if !output.status.success() {
            return Err(DeployError::NotificationError(format!(
                "sendmail exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
