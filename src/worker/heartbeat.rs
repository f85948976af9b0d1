use std::time::Duration;

use crate::queue::{Claim, JobQueue};

/// Keeps a claim visible while its job runs by periodically extending the
/// claim's visibility deadline.
pub struct ClaimHeartbeat {
    interval: Duration,
}

impl ClaimHeartbeat {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Touch the claim on every tick. Runs until dropped; once the claim has
    /// been reclaimed it stops touching and idles.
    pub async fn run(&self, queue: &JobQueue, claim: &Claim) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the claim is fresh.
        interval.tick().await;

        loop {
            interval.tick().await;
            if !queue.touch(claim) {
                tracing::warn!(job_id = %claim.job_id(), "Claim expired while job was running");
                std::future::pending::<()>().await;
            }
        }
    }
}
