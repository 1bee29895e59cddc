//! Best-effort completion notifications.
//!
//! A notification is sent once a job reaches a terminal state. Delivery
//! failures are returned to the caller, which logs them; they never change
//! the job's status.

use std::time::Duration;

use serde::Serialize;

use crate::error::NotifyError;
use crate::model::JobStatus;
use crate::sanitize::redact_url;

/// Body POSTed to a job's webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub job_id: i64,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, target: &str, notification: &Notification) -> Result<(), NotifyError>;
}

/// Discards every notification.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _target: &str, _notification: &Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// POSTs the notification as JSON; any non-2xx answer is an error.
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(NotifyError::Client)?;
        Ok(Self { client })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, target: &str, notification: &Notification) -> Result<(), NotifyError> {
        let url = redact_url(target);
        let response = self
            .client
            .post(target)
            .json(notification)
            .send()
            .map_err(|e| NotifyError::Request {
                url: url.clone(),
                source: e.without_url(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                url,
                status: status.as_u16(),
            });
        }
        tracing::info!(job_id = notification.job_id, webhook = %url, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}
