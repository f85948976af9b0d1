//! Last-value-wins progress reporting for running jobs.
//!
//! Each job with activity gets a `watch` channel holding its latest
//! [`ProgressSnapshot`]. Publishing never waits on observers; a slow
//! subscriber simply skips intermediate snapshots. Subscribers see snapshots
//! of one job in publish order, and their streams end once
//! [`ProgressChannel::finish`] drops the job's sender.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub current: u64,
    /// `None` when the job cannot tell how much work remains.
    pub total: Option<u64>,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(job_id: Uuid, current: u64, total: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            job_id,
            current,
            total,
            message: message.into(),
            emitted_at: Utc::now(),
        }
    }

    /// Completion ratio in `[0, 1]`, if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.current.min(total)) as f64 / total as f64),
            None => None,
        }
    }
}

pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressSnapshot> + Send>>;

#[derive(Debug, Default)]
pub struct ProgressChannel {
    channels: Mutex<HashMap<Uuid, watch::Sender<Option<ProgressSnapshot>>>>,
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, watch::Sender<Option<ProgressSnapshot>>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the latest snapshot for the snapshot's job. Never blocks.
    pub fn publish(&self, snapshot: ProgressSnapshot) {
        let mut channels = self.lock();
        let sender = channels
            .entry(snapshot.job_id)
            .or_insert_with(|| watch::channel(None).0);
        sender.send_replace(Some(snapshot));
    }

    pub fn latest(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        self.lock()
            .get(&job_id)
            .and_then(|sender| sender.borrow().clone())
    }

    /// Stream of snapshots for one job, starting with the latest if any.
    ///
    /// The stream ends when [`finish`](Self::finish) is called for the job or
    /// the subscriber drops it.
    pub fn subscribe(&self, job_id: Uuid) -> ProgressStream {
        let rx = {
            let mut channels = self.lock();
            channels
                .entry(job_id)
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };
        Box::pin(WatchStream::new(rx).filter_map(|snapshot| snapshot))
    }

    /// Drop the job's channel, ending every open subscription.
    pub fn finish(&self, job_id: Uuid) {
        self.lock().remove(&job_id);
    }

    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.lock()
            .get(&job_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of jobs with a live channel.
    pub fn tracked_jobs(&self) -> usize {
        self.lock().len()
    }
}
