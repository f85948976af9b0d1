use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

/// Floor for periodic intervals; `tokio::time::interval` rejects a zero period.
const MIN_TICK_MS: u64 = 1;

/// Exponential backoff between attempts of a retried job.
///
/// The delay before attempt `n + 1` is `base_delay_ms * 2^(n - 1)`, capped at
/// `max_delay_ms`, plus up to `jitter` of that value chosen at random.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added as random jitter (0.0 disables it).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn no_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the next attempt, given the attempt that just failed (1-based).
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(32);
        let base = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);

        let jitter_ms = if self.jitter > 0.0 && base > 0 {
            let span = (base as f64 * self.jitter) as u64;
            rand::thread_rng().gen_range(0..=span)
        } else {
            0
        };

        Duration::from_millis(base + jitter_ms)
    }
}

/// Tuning knobs for the job engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent execution units.
    pub workers: usize,
    /// Maximum number of entries waiting in the queue.
    pub queue_capacity: usize,
    /// Window after which an unacknowledged claim is re-queued.
    pub visibility_timeout_ms: u64,
    /// How often a running job extends its claim.
    pub heartbeat_interval_ms: u64,
    /// How often expired claims are collected.
    pub reaper_interval_ms: u64,
    /// Attempts granted to a job that does not ask for a specific number.
    pub default_max_attempts: u32,
    pub retry: RetryPolicy,
    /// Time a running job gets to observe cancellation before it is dropped.
    pub cancel_grace_ms: u64,
    pub scheduler_tick_ms: u64,
    /// Finished jobs older than this are removed by the `cleanup` job.
    pub retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 10_000,
            visibility_timeout_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            reaper_interval_ms: 1_000,
            default_max_attempts: 3,
            retry: RetryPolicy::default(),
            cancel_grace_ms: 5_000,
            scheduler_tick_ms: 1_000,
            retention_secs: 24 * 60 * 60,
        }
    }
}

impl EngineConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(MIN_TICK_MS))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(MIN_TICK_MS))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(MIN_TICK_MS))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Process-level settings for `taskmill serve`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the HTTP API. `None` runs the engine headless.
    pub api_addr: Option<SocketAddr>,
    /// JSON file backing the job store. `None` keeps jobs in memory.
    pub data_path: Option<PathBuf>,
    /// Endpoint receiving terminal-state notifications.
    pub notify_url: Option<String>,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            api_addr: Some(
                "127.0.0.1:8002"
                    .parse()
                    .expect("default api address is valid"),
            ),
            data_path: None,
            notify_url: None,
            engine: EngineConfig::default(),
        }
    }
}
