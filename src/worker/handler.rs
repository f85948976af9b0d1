use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::progress::{ProgressChannel, ProgressSnapshot};

/// How a job body failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Transient failure (network, contention). Retried with backoff while
    /// attempts remain.
    #[error("recoverable error: {0}")]
    Recoverable(String),

    /// Programming or data error. The job fails immediately.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// The body observed a cancellation request and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl ExecError {
    pub fn recoverable(msg: impl Into<String>) -> Self {
        ExecError::Recoverable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        ExecError::Fatal(msg.into())
    }
}

/// Everything a job body gets to see while it runs.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub owner_id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    /// 1-based attempt currently executing.
    pub attempt: u32,
    pub max_attempts: u32,
    progress: Arc<ProgressChannel>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl JobContext {
    pub(crate) fn new(
        job: &crate::job::Job,
        progress: Arc<ProgressChannel>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id,
            owner_id: job.owner_id.clone(),
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            progress,
            cancel,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop accepting progress reports; called once the outcome is recorded.
    pub(crate) fn seal(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Publish a progress snapshot. Never blocks.
    pub fn report(&self, current: u64, total: Option<u64>, message: impl Into<String>) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        self.progress
            .publish(ProgressSnapshot::new(self.job_id, current, total, message));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// `Err(ExecError::Cancelled)` if cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<(), ExecError> {
        if self.is_cancelled() {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// An execution routine for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Check the payload shape at submission time.
    fn validate(&self, _payload: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }

    async fn execute(&self, ctx: JobContext) -> Result<serde_json::Value, ExecError>;
}

/// Execution routines keyed by job-type tag, fixed before the engine starts.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same tag.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler) -> &mut Self {
        let job_type = job_type.into();
        tracing::debug!(job_type = %job_type, "Registered job handler");
        self.handlers.insert(job_type, Arc::new(handler));
        self
    }

    pub fn with(mut self, job_type: impl Into<String>, handler: impl JobHandler) -> Self {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
