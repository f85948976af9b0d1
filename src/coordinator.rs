//! Public entry point of the engine.
//!
//! The [`Coordinator`] validates submissions against the [`HandlerRegistry`],
//! records them in the [`JobStore`], hands them to the [`JobQueue`], and
//! answers status, listing, cancellation and progress queries.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TaskmillError};
use crate::job::{Failure, Job, JobState, StateChange};
use crate::notify::{self, Notifier};
use crate::progress::{ProgressChannel, ProgressSnapshot, ProgressStream};
use crate::queue::{JobQueue, QueueEntry};
use crate::store::JobStore;
use crate::worker::{HandlerRegistry, RunningJobs};

/// Bound on re-reads while a job keeps changing state under a cancel request.
const MAX_CANCEL_ROUNDS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub owner_id: String,
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Caller-chosen id. Submitting an id twice fails with `DuplicateId`.
    #[serde(default)]
    pub job_id: Option<Uuid>,
}

impl SubmitRequest {
    pub fn new(
        owner_id: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            job_type: job_type.into(),
            payload,
            max_attempts: None,
            job_id: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

/// A job record merged with its latest progress snapshot while it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub job: Job,
    pub progress: Option<ProgressSnapshot>,
}

pub struct Coordinator {
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    progress: Arc<ProgressChannel>,
    registry: Arc<HandlerRegistry>,
    running: Arc<RunningJobs>,
    notifier: Arc<dyn Notifier>,
    default_max_attempts: u32,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<JobQueue>,
        progress: Arc<ProgressChannel>,
        registry: Arc<HandlerRegistry>,
        running: Arc<RunningJobs>,
        notifier: Arc<dyn Notifier>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            queue,
            progress,
            registry,
            running,
            notifier,
            default_max_attempts,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Validate, record and enqueue a job.
    ///
    /// # Errors
    ///
    /// - `UnknownJobType` if no handler is registered for the tag
    /// - `InvalidPayload` if the handler rejects the payload or `max_attempts` is zero
    /// - `DuplicateId` if the caller-supplied id is taken
    /// - `QueueRejected` if the queue refused the entry; the job is recorded as
    ///   `failed` rather than left `pending`
    pub async fn submit(&self, request: SubmitRequest) -> Result<Uuid> {
        let handler = self
            .registry
            .get(&request.job_type)
            .ok_or_else(|| TaskmillError::UnknownJobType(request.job_type.clone()))?;

        let invalid = |reason: String| TaskmillError::InvalidPayload {
            job_type: request.job_type.clone(),
            reason,
        };

        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1".to_string()));
        }
        handler.validate(&request.payload).map_err(invalid)?;

        let job = match request.job_id {
            Some(id) => Job::with_id(
                id,
                request.owner_id,
                request.job_type,
                request.payload,
                max_attempts,
            ),
            None => Job::new(
                request.owner_id,
                request.job_type,
                request.payload,
                max_attempts,
            ),
        };
        let job_type = job.job_type.clone();
        let entry = QueueEntry::new(job.id, job_type.clone());
        let job_id = self.store.create(job).await?;

        if let Err(e) = self.queue.enqueue(entry) {
            tracing::warn!(job_id = %job_id, error = %e, "Queue rejected job");
            let change =
                StateChange::failed(Failure::queue_rejected(&e)).expecting(JobState::Pending);
            match self.store.update_state(job_id, change).await {
                Ok(job) => notify::dispatch(&self.notifier, &job),
                Err(err) => {
                    tracing::error!(job_id = %job_id, error = %err, "Failed to record queue rejection")
                }
            }
            // Someone may have subscribed between create and the rejection.
            self.progress.finish(job_id);
            return Err(TaskmillError::QueueRejected(job_id));
        }

        tracing::info!(job_id = %job_id, job_type = %job_type, "Job submitted");
        Ok(job_id)
    }

    /// The last recorded state of a job, with live progress while it runs.
    pub async fn status(&self, job_id: Uuid) -> Result<JobStatusView> {
        let job = self.store.get(job_id).await?;
        let progress = if job.state == JobState::Running {
            self.progress.latest(job_id)
        } else {
            None
        };
        Ok(JobStatusView { job, progress })
    }

    pub async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Job>> {
        self.store.list_by_owner(owner_id).await
    }

    /// Cancel a job that has not finished.
    ///
    /// A queued job is removed from the queue and fails with `Cancelled`
    /// immediately. A running job is asked to stop; the worker records the
    /// failure once the body returns or the cancel grace period elapses. A job
    /// recorded as running that no worker here holds is failed directly.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        for _ in 0..MAX_CANCEL_ROUNDS {
            let job = self.store.get(job_id).await?;

            match job.state {
                JobState::Succeeded | JobState::Failed => {
                    return Err(TaskmillError::AlreadyTerminal(job_id));
                }
                JobState::Pending | JobState::Requeued => {
                    self.queue.void(job_id);
                    if self.fail_cancelled(&job).await? {
                        tracing::info!(job_id = %job_id, "Cancelled queued job");
                        return Ok(());
                    }
                }
                JobState::Running if self.running.cancel(job_id) => {
                    // The attempt may have been requeued just before the token
                    // was set; that entry is cancelled on the next round.
                    let now = self.store.get(job_id).await?;
                    if now.state == JobState::Running || now.is_terminal() {
                        tracing::info!(job_id = %job_id, "Requested cancellation of running job");
                        return Ok(());
                    }
                }
                JobState::Running => {
                    if self.fail_cancelled(&job).await? {
                        tracing::warn!(job_id = %job_id, "Cancelled running job with no live worker");
                        return Ok(());
                    }
                }
            }
        }

        Err(TaskmillError::Internal(format!(
            "job {} kept changing state while being cancelled",
            job_id
        )))
    }

    /// Fail `job` as cancelled if it is still in the state and attempt it was
    /// read at. Returns false when it moved on in the meantime.
    async fn fail_cancelled(&self, job: &Job) -> Result<bool> {
        let change = StateChange::failed(Failure::cancelled())
            .expecting(job.state)
            .at_attempt(job.attempts);
        match self.store.update_state(job.id, change).await {
            Ok(job) => {
                self.progress.finish(job.id);
                notify::dispatch(&self.notifier, &job);
                Ok(true)
            }
            Err(TaskmillError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Follow a job's progress. The stream ends when the job finishes; for a
    /// job that already finished it ends immediately.
    pub async fn subscribe(&self, job_id: Uuid) -> Result<ProgressStream> {
        self.store.get(job_id).await?;
        let stream = self.progress.subscribe(job_id);

        // Checked after subscribing so a job finishing in between cannot
        // leave the stream open forever.
        if self.store.get(job_id).await?.is_terminal() {
            self.progress.finish(job_id);
        }
        Ok(stream)
    }
}
