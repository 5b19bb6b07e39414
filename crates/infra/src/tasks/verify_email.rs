//! Verification email task.

use std::sync::Arc;

use anyhow::Context;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use simplebank_ledger::CreateVerifyEmailParams;

use super::processor::TaskProcessor;
use super::types::{Task, TaskError};
use crate::db::{Database, LedgerStore};
use crate::mail::{Email, EmailSender};

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

const SECRET_CODE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendVerifyEmailPayload {
    pub username: String,
}

/// Records a verification code for a new user and mails the link.
pub struct VerifyEmailHandler<D> {
    store: LedgerStore<D>,
    mailer: Arc<dyn EmailSender>,
    verify_url: String,
}

impl<D: Database> VerifyEmailHandler<D> {
    pub fn new(
        store: LedgerStore<D>,
        mailer: Arc<dyn EmailSender>,
        verify_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailer,
            verify_url: verify_url.into(),
        }
    }

    pub fn register(self: Arc<Self>, processor: &mut TaskProcessor) {
        processor.register_handler(TASK_SEND_VERIFY_EMAIL, move |task| {
            let handler = Arc::clone(&self);
            async move { handler.handle(task).await }
        });
    }

    /// Malformed payloads fail terminally. Everything else is transient,
    /// including a missing user: the task may run before the transaction
    /// that created the user has committed.
    #[instrument(skip_all, fields(task_id = %task.id), err)]
    pub async fn handle(&self, task: Task) -> Result<(), TaskError> {
        let payload: SendVerifyEmailPayload = serde_json::from_slice(&task.payload)
            .context("failed to unmarshal payload")
            .map_err(TaskError::terminal)?;

        let user = self
            .store
            .get_user(&payload.username)
            .await
            .context("failed to get user")
            .map_err(TaskError::transient)?;

        let verify_email = self
            .store
            .create_verify_email(&CreateVerifyEmailParams {
                username: user.username.clone(),
                email: user.email.clone(),
                secret_code: secret_code(),
            })
            .await
            .context("failed to create verify email")
            .map_err(TaskError::transient)?;

        let link = format!(
            "{}?email_id={}&secret_code={}",
            self.verify_url, verify_email.id, verify_email.secret_code
        );
        let email = Email {
            subject: "Welcome to Simple Bank".to_string(),
            content: format!(
                "Hello {},<br/>\
                 Thank you for registering with us!<br/>\
                 Please <a href=\"{link}\">click here</a> to verify your email address.<br/>",
                user.full_name
            ),
            to: vec![user.email.clone()],
            ..Default::default()
        };

        self.mailer
            .send_email(&email)
            .await
            .context("failed to send verify email")
            .map_err(TaskError::transient)?;

        info!(
            task_type = %task.task_type,
            username = %user.username,
            email = %user.email,
            "processed task"
        );
        Ok(())
    }
}

fn secret_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_CODE_LEN)
        .map(char::from)
        .collect()
}
