use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::dashboard::ApiState;
use crate::error::{Result, TaskmillError};
use crate::job::{JobState, StateChange};
use crate::notify::Notifier;
use crate::progress::ProgressChannel;
use crate::queue::{JobQueue, QueueEntry};
use crate::scheduler::Scheduler;
use crate::store::JobStore;
use crate::worker::{ClaimReaper, HandlerRegistry, JobExecutor, RunningJobs, WorkerPool};

/// Owns every component of a running job engine.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    progress: Arc<ProgressChannel>,
    coordinator: Arc<Coordinator>,
    pool: Arc<WorkerPool>,
    reaper: Arc<ClaimReaper>,
    scheduler: Arc<Scheduler>,
    background: CancellationToken,
    tracker: TaskTracker,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let queue = Arc::new(JobQueue::with_capacity(
            config.queue_capacity,
            config.visibility_timeout(),
        ));
        let progress = Arc::new(ProgressChannel::new());
        let running = Arc::new(RunningJobs::new());
        let registry = Arc::new(registry);

        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&progress),
            Arc::clone(&registry),
            Arc::clone(&running),
            Arc::clone(&notifier),
            config.default_max_attempts,
        ));
        let executor = Arc::new(JobExecutor::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&progress),
            registry,
            notifier,
            running,
            &config,
        ));
        let pool = Arc::new(WorkerPool::new(executor));
        let reaper = Arc::new(ClaimReaper::new(Arc::clone(&store), Arc::clone(&queue)));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&coordinator)));

        Self {
            config,
            store,
            queue,
            progress,
            coordinator,
            pool,
            reaper,
            scheduler,
            background: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn progress(&self) -> &Arc<ProgressChannel> {
        &self.progress
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            coordinator: Arc::clone(&self.coordinator),
            pool: Arc::clone(&self.pool),
        }
    }

    /// Put unfinished jobs from the store back on the queue.
    ///
    /// A job recorded as `running` belonged to a process that is gone, so it
    /// is moved to `requeued` first. Returns how many jobs were re-enqueued.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;

        for job in self.store.list_unfinished().await? {
            if job.state == JobState::Running {
                let change = StateChange::requeued()
                    .expecting(JobState::Running)
                    .at_attempt(job.attempts);
                match self.store.update_state(job.id, change).await {
                    Ok(_) => {}
                    Err(TaskmillError::InvalidTransition { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }

            self.queue
                .requeue(QueueEntry::new(job.id, job.job_type.clone()), Duration::ZERO);
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered unfinished jobs");
        }
        Ok(recovered)
    }

    /// Recover, then start workers, the claim reaper and the scheduler.
    pub async fn start(&self) -> Result<usize> {
        let recovered = self.recover().await?;

        self.pool.resize(self.config.workers);

        let reaper = Arc::clone(&self.reaper);
        let interval = self.config.reaper_interval();
        let token = self.background.child_token();
        self.tracker.spawn(async move {
            reaper.run(interval, token).await;
        });

        let scheduler = Arc::clone(&self.scheduler);
        let tick = self.config.scheduler_tick();
        let token = self.background.child_token();
        self.tracker.spawn(async move {
            scheduler.run(tick, token).await;
        });

        tracing::info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "Engine started"
        );
        Ok(recovered)
    }

    /// Stop the scheduler, let running jobs finish, then close the queue.
    pub async fn shutdown(&self) {
        tracing::info!("Engine shutting down");

        self.background.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        self.pool.shutdown().await;
        self.queue.close();

        tracing::info!(backlog = self.queue.len(), "Engine stopped");
    }

    /// Run until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.start().await?;
        shutdown.cancelled().await;
        self.shutdown().await;
        Ok(())
    }
}
