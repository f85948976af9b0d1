use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{EngineConfig, RetryPolicy};
use crate::error::TaskmillError;
use crate::job::{Failure, FailureKind, Job, JobState, StateChange};
use crate::notify::{self, Notifier};
use crate::progress::ProgressChannel;
use crate::queue::{Claim, JobQueue};
use crate::store::JobStore;
use crate::worker::handler::{ExecError, HandlerRegistry, JobContext, JobHandler};
use crate::worker::heartbeat::ClaimHeartbeat;

/// Cancellation tokens of the jobs currently executing on this process.
///
/// Keyed by job and then by claim: after a redelivery the stale attempt and
/// the new one may both be running, each with its own token.
#[derive(Debug, Default)]
pub struct RunningJobs {
    tokens: Mutex<HashMap<Uuid, HashMap<u64, CancellationToken>>>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, HashMap<u64, CancellationToken>>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, claim: &Claim) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock()
            .entry(claim.job_id())
            .or_default()
            .insert(claim.id(), token.clone());
        token
    }

    /// Drop the token registered for `claim`, leaving other claims of the job alone.
    fn remove(&self, claim: &Claim) {
        let mut tokens = self.lock();
        if let Some(claims) = tokens.get_mut(&claim.job_id()) {
            claims.remove(&claim.id());
            if claims.is_empty() {
                tokens.remove(&claim.job_id());
            }
        }
    }

    /// Ask every running attempt of a job to stop. Returns false if the job
    /// is not running here.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.lock().get(&job_id) {
            Some(claims) if !claims.is_empty() => {
                claims.values().for_each(CancellationToken::cancel);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.lock().contains_key(&job_id)
    }

    /// Attempts currently executing, counting each claim separately.
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What was recorded for a processed claim.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub state: JobState,
    pub attempt: u32,
    pub error: Option<String>,
}

enum BodyOutcome {
    Completed(Result<serde_json::Value, ExecError>),
    Panicked(String),
    /// Cancellation was requested and the body did not return within the grace period.
    Abandoned,
}

/// Runs claimed jobs and records their outcome.
///
/// Shared by every execution unit of a [`WorkerPool`](crate::worker::WorkerPool).
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    progress: Arc<ProgressChannel>,
    registry: Arc<HandlerRegistry>,
    notifier: Arc<dyn Notifier>,
    running: Arc<RunningJobs>,
    retry: RetryPolicy,
    heartbeat_interval: Duration,
    cancel_grace: Duration,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<JobQueue>,
        progress: Arc<ProgressChannel>,
        registry: Arc<HandlerRegistry>,
        notifier: Arc<dyn Notifier>,
        running: Arc<RunningJobs>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            progress,
            registry,
            notifier,
            running,
            retry: config.retry.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            cancel_grace: config.cancel_grace(),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn running(&self) -> &Arc<RunningJobs> {
        &self.running
    }

    /// Execute one claimed entry end to end.
    ///
    /// Returns `None` when nothing was recorded: the job vanished, changed
    /// under us, or the store failed (in which case the claim is left to
    /// expire and the entry is delivered again).
    pub async fn process(&self, claim: Claim) -> Option<ExecutionResult> {
        let job_id = claim.job_id();

        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(TaskmillError::JobNotFound(_)) => {
                tracing::warn!(job_id = %job_id, "Dropping queue entry for unknown job");
                self.queue.ack(&claim);
                return None;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load claimed job");
                return None;
            }
        };

        if job.is_terminal() {
            tracing::debug!(job_id = %job_id, state = %job.state, "Skipping finished job");
            self.queue.ack(&claim);
            return None;
        }

        if job.attempts >= job.max_attempts {
            let change = StateChange::failed(Failure::retries_exhausted(format!(
                "no attempts left after {} of {}",
                job.attempts, job.max_attempts
            )))
            .expecting(job.state)
            .at_attempt(job.attempts);
            return self.record(&claim, job.attempts, change).await;
        }

        // Register before the store says `running` so a cancel request that
        // observes `running` always finds the token.
        let token = self.running.register(&claim);
        let change = StateChange::running()
            .expecting(job.state)
            .at_attempt(job.attempts);
        let started = match self.store.update_state(job_id, change).await {
            Ok(job) => job,
            Err(TaskmillError::InvalidTransition { from, .. }) => {
                tracing::debug!(job_id = %job_id, state = %from, "Job changed before it could start");
                self.running.remove(&claim);
                self.queue.ack(&claim);
                return None;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to mark job running");
                self.running.remove(&claim);
                return None;
            }
        };

        tracing::info!(
            job_id = %job_id,
            job_type = %started.job_type,
            attempt = started.attempts,
            max_attempts = started.max_attempts,
            "Job started"
        );

        let ctx = JobContext::new(&started, Arc::clone(&self.progress), token.clone());
        let handler = self.registry.get(&started.job_type);
        let outcome = self.run_body(handler, ctx.clone(), &claim, &token).await;
        ctx.seal();

        let attempt = started.attempts;
        let failed = |failure: Failure| {
            StateChange::failed(failure)
                .expecting(JobState::Running)
                .at_attempt(attempt)
        };

        let recorded = match outcome {
            BodyOutcome::Completed(Err(ExecError::Recoverable(msg)))
                if !token.is_cancelled() && attempt < started.max_attempts =>
            {
                self.retry(&claim, &started, msg, &token).await
            }
            outcome => {
                let change = match outcome {
                    BodyOutcome::Completed(Ok(value)) => StateChange::succeeded(value)
                        .expecting(JobState::Running)
                        .at_attempt(attempt),
                    BodyOutcome::Completed(Err(ExecError::Cancelled)) | BodyOutcome::Abandoned => {
                        failed(Failure::cancelled())
                    }
                    BodyOutcome::Completed(Err(_)) if token.is_cancelled() => {
                        failed(Failure::cancelled())
                    }
                    BodyOutcome::Completed(Err(ExecError::Fatal(msg))) => {
                        failed(Failure::new(FailureKind::Error, msg))
                    }
                    BodyOutcome::Completed(Err(ExecError::Recoverable(msg))) => {
                        failed(Failure::retries_exhausted(msg))
                    }
                    BodyOutcome::Panicked(msg) => failed(Failure::new(
                        FailureKind::Panicked,
                        format!("Job panicked: {}", msg),
                    )),
                };
                self.record(&claim, attempt, change).await
            }
        };

        // Deregistered only once the outcome is committed: while the store
        // says `running`, a cancel request must find a token.
        self.running.remove(&claim);
        recorded
    }

    async fn run_body(
        &self,
        handler: Option<Arc<dyn JobHandler>>,
        ctx: JobContext,
        claim: &Claim,
        token: &CancellationToken,
    ) -> BodyOutcome {
        let Some(handler) = handler else {
            return BodyOutcome::Completed(Err(ExecError::fatal(format!(
                "No handler registered for job type {}",
                ctx.job_type
            ))));
        };

        let heartbeat = {
            let queue = Arc::clone(&self.queue);
            let claim = claim.clone();
            let interval = self.heartbeat_interval;
            tokio::spawn(async move { ClaimHeartbeat::new(interval).run(&queue, &claim).await })
        };

        let grace = self.cancel_grace;
        let forced_stop = async {
            token.cancelled().await;
            tokio::time::sleep(grace).await;
        };

        let body = AssertUnwindSafe(handler.execute(ctx)).catch_unwind();

        let outcome = tokio::select! {
            result = body => match result {
                Ok(result) => BodyOutcome::Completed(result),
                Err(panic) => BodyOutcome::Panicked(panic_message(panic.as_ref())),
            },
            _ = forced_stop => {
                tracing::warn!(job_id = %claim.job_id(), "Job ignored cancellation, abandoning it");
                BodyOutcome::Abandoned
            }
        };

        heartbeat.abort();
        outcome
    }

    /// Send the job back to the queue for another attempt after a backoff delay.
    ///
    /// A cancel request that reached the token while the retry was being
    /// recorded fails the job instead of requeueing it.
    async fn retry(
        &self,
        claim: &Claim,
        job: &Job,
        error: String,
        token: &CancellationToken,
    ) -> Option<ExecutionResult> {
        let change = StateChange::requeued()
            .expecting(JobState::Running)
            .at_attempt(job.attempts);

        match self.store.update_state(job.id, change).await {
            Ok(_) if token.is_cancelled() => {
                let change = StateChange::failed(Failure::cancelled())
                    .expecting(JobState::Requeued)
                    .at_attempt(job.attempts);
                self.record(claim, job.attempts, change).await
            }
            Ok(_) => {
                let delay = self.retry.delay_for(job.attempts);
                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, retrying"
                );
                self.queue.ack(claim);
                self.queue.requeue(claim.entry.clone(), delay);
                Some(ExecutionResult {
                    job_id: job.id,
                    state: JobState::Requeued,
                    attempt: job.attempts,
                    error: Some(error),
                })
            }
            Err(TaskmillError::InvalidTransition { from, .. }) => {
                tracing::warn!(job_id = %job.id, state = %from, "Discarding stale retry");
                self.queue.ack(claim);
                None
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to requeue job");
                None
            }
        }
    }

    /// Record a terminal outcome, release the claim and notify the owner.
    async fn record(
        &self,
        claim: &Claim,
        attempt: u32,
        change: StateChange,
    ) -> Option<ExecutionResult> {
        let job_id = claim.job_id();
        match self.store.update_state(job_id, change).await {
            Ok(job) => {
                self.queue.ack(claim);
                self.progress.finish(job_id);

                let error = job.failure.as_ref().map(|f| f.to_string());
                match &error {
                    None => tracing::info!(job_id = %job_id, attempt, "Job succeeded"),
                    Some(e) => tracing::info!(job_id = %job_id, attempt, error = %e, "Job failed"),
                }

                notify::dispatch(&self.notifier, &job);
                Some(ExecutionResult {
                    job_id,
                    state: job.state,
                    attempt: job.attempts,
                    error,
                })
            }
            Err(TaskmillError::InvalidTransition { from, .. }) => {
                tracing::warn!(job_id = %job_id, state = %from, "Discarding stale outcome");
                self.queue.ack(claim);
                None
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job_id,
                    error = %e,
                    "Failed to record job outcome, claim will expire and be redelivered"
                );
                None
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
