//! Outbound mail boundary.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

/// An outgoing message. `content` is HTML.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Email {
    pub subject: String,
    pub content: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attach_files: Vec<PathBuf>,
}

impl Email {
    /// Checks the message is deliverable before it is handed to a transport.
    pub fn validate(&self) -> Result<(), MailError> {
        if self.to.is_empty() {
            return Err(MailError::Invalid("no recipients".into()));
        }
        if self.subject.trim().is_empty() {
            return Err(MailError::Invalid("empty subject".into()));
        }
        let bad = self
            .to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .find(|addr| !addr.contains('@'));
        if let Some(addr) = bad {
            return Err(MailError::Invalid(format!("bad address: {addr}")));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("invalid email: {0}")]
    Invalid(String),
    #[error("failed to send email: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, email: &Email) -> Result<(), MailError>;
}

/// Writes outgoing mail to the log instead of delivering it.
#[derive(Debug, Clone)]
pub struct LogEmailSender {
    sender_name: String,
    sender_address: String,
}

impl LogEmailSender {
    pub fn new(sender_name: impl Into<String>, sender_address: impl Into<String>) -> Self {
        Self {
            sender_name: sender_name.into(),
            sender_address: sender_address.into(),
        }
    }
}

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_email(&self, email: &Email) -> Result<(), MailError> {
        email.validate()?;
        for file in &email.attach_files {
            if !file.is_file() {
                return Err(MailError::Delivery(format!(
                    "failed to attach file {}",
                    file.display()
                )));
            }
        }

        info!(
            sender_name = %self.sender_name,
            sender_address = %self.sender_address,
            to = ?email.to,
            cc = ?email.cc,
            bcc = ?email.bcc,
            subject = %email.subject,
            attachments = email.attach_files.len(),
            "sent email"
        );
        Ok(())
    }
}
