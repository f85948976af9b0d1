//! Best-effort notifications on terminal job transitions.
//!
//! Dispatch is spawned off the worker: a slow or failing notifier never
//! delays or rolls back the transition that triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::job::{Job, JobState};

/// HTTP request timeout for a single delivery.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Notification endpoint returned HTTP {0}")]
    HttpStatus(u16),
}

/// Message sent to the job owner when a job finishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobNotification {
    pub user_id: String,
    pub job_id: Uuid,
    pub job_type: String,
    pub state: JobState,
    pub title: String,
    pub message: String,
}

impl JobNotification {
    pub fn for_job(job: &Job) -> Self {
        let (title, message) = match (&job.state, &job.failure) {
            (JobState::Succeeded, _) => (
                "Task Completed".to_string(),
                format!(
                    "Your background task #{} has been completed successfully!",
                    job.id
                ),
            ),
            (_, Some(failure)) => (
                "Task Failed".to_string(),
                format!("Your background task #{} failed: {}", job.id, failure.message),
            ),
            _ => (
                "Task Updated".to_string(),
                format!("Your background task #{} is {}", job.id, job.state),
            ),
        };

        Self {
            user_id: job.owner_id.clone(),
            job_id: job.id,
            job_type: job.job_type.clone(),
            state: job.state,
            title,
            message,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        tracing::info!(
            user_id = %notification.user_id,
            job_id = %notification.job_id,
            state = %notification.state,
            title = %notification.title,
            "Job notification"
        );
        Ok(())
    }
}

/// POSTs notifications as JSON to an external notification service.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Fire-and-forget delivery of the notification for a terminal job.
pub fn dispatch(notifier: &Arc<dyn Notifier>, job: &Job) {
    let notifier = Arc::clone(notifier);
    let notification = JobNotification::for_job(job);
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notification).await {
            tracing::warn!(
                job_id = %notification.job_id,
                error = %e,
                "Failed to deliver job notification"
            );
        }
    });
}
