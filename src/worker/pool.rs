use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::worker::executor::JobExecutor;

struct WorkerUnit {
    id: usize,
    stop: CancellationToken,
}

/// A resizable set of execution units competing for queue entries.
///
/// Every unit loops `dequeue -> process` until its stop token fires. Stopping
/// only interrupts the wait for the next entry, so a unit removed by
/// [`resize`](Self::resize) or [`shutdown`](Self::shutdown) always finishes
/// the job it is running.
pub struct WorkerPool {
    executor: Arc<JobExecutor>,
    units: Mutex<Vec<WorkerUnit>>,
    tracker: TaskTracker,
    next_id: AtomicUsize,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(executor: Arc<JobExecutor>) -> Self {
        Self {
            executor,
            units: Mutex::new(Vec::new()),
            tracker: TaskTracker::new(),
            next_id: AtomicUsize::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WorkerUnit>> {
        self.units.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Grow or shrink the pool to `size` units.
    pub fn resize(&self, size: usize) {
        if self.shutdown.is_cancelled() {
            tracing::warn!(size, "Ignoring resize of a stopped worker pool");
            return;
        }

        let mut units = self.lock();
        let before = units.len();

        while units.len() < size {
            units.push(self.spawn_unit());
        }
        while units.len() > size {
            if let Some(unit) = units.pop() {
                tracing::info!(worker_id = unit.id, "Retiring worker");
                unit.stop.cancel();
            }
        }

        if before != size {
            tracing::info!(from = before, to = size, "Worker pool resized");
        }
    }

    fn spawn_unit(&self) -> WorkerUnit {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = self.shutdown.child_token();

        let executor = Arc::clone(&self.executor);
        let unit_stop = stop.clone();
        self.tracker.spawn(async move {
            run_unit(id, executor, unit_stop).await;
        });

        WorkerUnit { id, stop }
    }

    /// Number of active units (retiring units are not counted).
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Number of jobs executing right now.
    pub fn busy(&self) -> usize {
        self.executor.running().len()
    }

    /// Stop every unit and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.lock().clear();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Worker pool stopped");
    }
}

async fn run_unit(id: usize, executor: Arc<JobExecutor>, stop: CancellationToken) {
    tracing::debug!(worker_id = id, "Worker started");

    loop {
        let claim = match executor.queue().dequeue(&stop).await {
            Ok(claim) => claim,
            Err(_) => break,
        };

        tracing::debug!(worker_id = id, job_id = %claim.job_id(), "Claimed job");
        executor.process(claim).await;
    }

    tracing::debug!(worker_id = id, "Worker stopped");
}
