use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, TaskmillError};

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Descriptor handed from submitters to workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub job_type: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(job_id: Uuid, job_type: impl Into<String>) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Exclusive ownership of a dequeued entry until it is acknowledged or its
/// visibility deadline expires.
#[derive(Debug, Clone)]
pub struct Claim {
    pub entry: QueueEntry,
    token: u64,
}

impl Claim {
    pub fn job_id(&self) -> Uuid {
        self.entry.job_id
    }

    /// Distinguishes claims of the same job after a redelivery.
    pub fn id(&self) -> u64 {
        self.token
    }
}

#[derive(Debug)]
struct InFlight {
    entry: QueueEntry,
    deadline: Instant,
}

#[derive(Debug)]
struct Delayed {
    due: Instant,
    seq: u64,
    entry: QueueEntry,
}

// BinaryHeap is a max-heap; invert so the earliest due entry is on top.
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Delayed {}

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<QueueEntry>,
    delayed: BinaryHeap<Delayed>,
    in_flight: HashMap<u64, InFlight>,
    next_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Move every delayed entry whose backoff elapsed to the back of the ready list.
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(d) = self.delayed.pop() {
                self.ready.push_back(d.entry);
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.due)
    }

    fn backlog(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }
}

/// FIFO hand-off of job descriptors from submitters to workers.
///
/// Claims are destructive: a dequeued entry leaves the ready list under the
/// queue lock and is tracked in flight, so two workers never receive the same
/// entry. In-flight entries that are neither acknowledged nor touched before
/// their visibility deadline are handed back by [`JobQueue::take_expired`].
#[derive(Debug)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    visibility_timeout: Duration,
    notify: Notify,
    closed: CancellationToken,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_capacity(capacity: usize, visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            visibility_timeout,
            notify: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Nothing panics while holding the lock, but don't cascade if it ever does.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an entry. Never blocks; fails with `QueueFull` when the backlog
    /// is at capacity.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TaskmillError::Cancelled);
        }
        {
            let mut inner = self.lock();
            if inner.backlog() >= self.capacity {
                return Err(TaskmillError::QueueFull(self.capacity));
            }
            inner.ready.push_back(entry);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Return an entry for another attempt once `delay` has elapsed.
    ///
    /// Requeues bypass the capacity bound: the job was already accepted.
    pub fn requeue(&self, entry: QueueEntry, delay: Duration) {
        let mut inner = self.lock();
        if delay.is_zero() {
            inner.ready.push_back(entry);
            drop(inner);
            self.notify.notify_one();
        } else {
            let seq = inner.next_seq();
            inner.delayed.push(Delayed {
                due: Instant::now() + delay,
                seq,
                entry,
            });
            drop(inner);
            // Sleeping workers must recompute their wake-up time.
            self.notify.notify_waiters();
        }
    }

    /// Wait for the next entry and claim it.
    ///
    /// Fails with `Cancelled` once `stop` fires or the queue is closed.
    pub async fn dequeue(&self, stop: &CancellationToken) -> Result<Claim> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if stop.is_cancelled() || self.closed.is_cancelled() {
                return Err(TaskmillError::Cancelled);
            }

            let next_due = {
                let mut inner = self.lock();
                let now = Instant::now();
                inner.promote_due(now);
                if let Some(entry) = inner.ready.pop_front() {
                    let token = inner.next_seq();
                    inner.in_flight.insert(
                        token,
                        InFlight {
                            entry: entry.clone(),
                            deadline: now + self.visibility_timeout,
                        },
                    );
                    return Ok(Claim { entry, token });
                }
                inner.next_due()
            };

            let backoff = async {
                match next_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = backoff => {}
                _ = stop.cancelled() => return Err(TaskmillError::Cancelled),
                _ = self.closed.cancelled() => return Err(TaskmillError::Cancelled),
            }
        }
    }

    /// Acknowledge a claim. Returns false if the claim was already reclaimed.
    pub fn ack(&self, claim: &Claim) -> bool {
        self.lock().in_flight.remove(&claim.token).is_some()
    }

    /// Push a claim's visibility deadline forward. Returns false if the claim
    /// is no longer held.
    pub fn touch(&self, claim: &Claim) -> bool {
        let mut inner = self.lock();
        match inner.in_flight.get_mut(&claim.token) {
            Some(in_flight) => {
                in_flight.deadline = Instant::now() + self.visibility_timeout;
                true
            }
            None => false,
        }
    }

    /// Remove and return in-flight entries whose visibility deadline passed.
    ///
    /// The caller decides how to put them back (see [`JobQueue::requeue`]).
    pub fn take_expired(&self, now: Instant) -> Vec<QueueEntry> {
        let mut inner = self.lock();
        let expired: Vec<u64> = inner
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        expired
            .into_iter()
            .filter_map(|token| inner.in_flight.remove(&token))
            .map(|f| f.entry)
            .collect()
    }

    /// Drop every unclaimed entry for a job. Returns true if one was removed.
    pub fn void(&self, job_id: Uuid) -> bool {
        let mut inner = self.lock();
        let before = inner.backlog();
        inner.ready.retain(|e| e.job_id != job_id);
        inner.delayed.retain(|d| d.entry.job_id != job_id);
        inner.backlog() < before
    }

    /// Close the queue: every current and future `dequeue` fails with `Cancelled`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Entries waiting to be claimed, including those in backoff.
    pub fn len(&self) -> usize {
        self.lock().backlog()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}
