use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TaskmillError};
use crate::job::{JobState, StateChange};
use crate::queue::{JobQueue, QueueEntry};
use crate::store::JobStore;

/// Returns abandoned claims to the queue once their visibility timeout expires.
pub struct ClaimReaper {
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
}

impl ClaimReaper {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Collect expired claims once. Returns how many entries were re-queued.
    pub async fn reap(&self, now: Instant) -> usize {
        let mut requeued = 0;
        for entry in self.queue.take_expired(now) {
            match self.redeliver(entry).await {
                Ok(true) => requeued += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "Failed to re-queue expired claim"),
            }
        }
        requeued
    }

    async fn redeliver(&self, entry: QueueEntry) -> Result<bool> {
        let job = match self.store.get(entry.job_id).await {
            Ok(job) => job,
            Err(TaskmillError::JobNotFound(_)) => return Ok(false),
            Err(e) => {
                // Keep the entry; the job record is authoritative once reachable again.
                self.queue.requeue(entry, Duration::ZERO);
                return Err(e);
            }
        };

        match job.state {
            JobState::Running => {
                let change = StateChange::requeued()
                    .expecting(JobState::Running)
                    .at_attempt(job.attempts);
                match self.store.update_state(job.id, change).await {
                    Ok(_) => {}
                    // Finished or re-claimed in the meantime.
                    Err(TaskmillError::InvalidTransition { .. }) => return Ok(false),
                    Err(e) => {
                        self.queue.requeue(entry, Duration::ZERO);
                        return Err(e);
                    }
                }
            }
            JobState::Pending | JobState::Requeued => {}
            JobState::Succeeded | JobState::Failed => return Ok(false),
        }

        tracing::warn!(
            job_id = %job.id,
            attempt = job.attempts,
            "Claim expired without acknowledgement, re-queueing"
        );
        self.queue.requeue(entry, Duration::ZERO);
        Ok(true)
    }

    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reap(Instant::now()).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}
