// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Confirmation email delivery.

use crate::error::AppError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const MAIL_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ConfirmationMailer: Send + Sync {
    async fn send_confirmation(&self, to: &str, key: &str) -> Result<(), AppError>;
}

#[derive(Serialize)]
struct MailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    text: String,
}

/// Sends mail through a transactional mail HTTP API.
pub struct HttpMailer {
    http_client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
    app_name: String,
}

impl HttpMailer {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        app_name: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(MAIL_TIMEOUT).build()?;
        Ok(Self {
            http_client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            from: from.into(),
            app_name: app_name.into(),
        })
    }
}

#[async_trait]
impl ConfirmationMailer for HttpMailer {
    async fn send_confirmation(&self, to: &str, key: &str) -> Result<(), AppError> {
        let request = MailRequest {
            from: &self.from,
            to: [to],
            subject: format!("Your {} confirmation code", self.app_name),
            text: format!(
                "Your {} email confirmation code is {}.\n\nIt expires in 5 minutes. \
                 If you did not request this, you can ignore this message.",
                self.app_name, key
            ),
        };

        let response = self
            .http_client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("mail request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Mail API error");
            return Err(AppError::Internal(anyhow::anyhow!(
                "mail API returned status {}",
                status
            )));
        }

        tracing::info!("Confirmation email sent");
        Ok(())
    }
}

/// A message handed to [`RecordingMailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentConfirmation {
    pub to: String,
    pub key: String,
}

/// Keeps messages in memory instead of sending them.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentConfirmation>>,
    fail: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentConfirmation> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Most recent key sent to `to`.
    pub fn last_key_for(&self, to: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.to == to)
            .map(|m| m.key)
    }
}

#[async_trait]
impl ConfirmationMailer for RecordingMailer {
    async fn send_confirmation(&self, to: &str, key: &str) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Internal(anyhow::anyhow!("recording mailer failure")));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentConfirmation {
                to: to.to_string(),
                key: key.to_string(),
            });
        Ok(())
    }
}
