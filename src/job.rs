use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TaskmillError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    /// Returned to the queue after a retryable failure or an expired claim.
    Requeued,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Requeued => write!(f, "requeued"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The job body reported an unrecoverable error.
    Error,
    /// A recoverable error occurred on the last permitted attempt.
    RetriesExhausted,
    Cancelled,
    /// The queue refused the entry at submission time.
    QueueRejected,
    /// The job body panicked.
    Panicked,
}

impl FailureKind {
    /// Failures a queued job may take without ever running.
    pub fn is_administrative(self) -> bool {
        matches!(
            self,
            FailureKind::Cancelled | FailureKind::QueueRejected | FailureKind::RetriesExhausted
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Error => write!(f, "Error"),
            FailureKind::RetriesExhausted => write!(f, "RetriesExhausted"),
            FailureKind::Cancelled => write!(f, "Cancelled"),
            FailureKind::QueueRejected => write!(f, "QueueRejected"),
            FailureKind::Panicked => write!(f, "Panicked"),
        }
    }
}

/// Why a job ended in `failed`. The message is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            kind.to_string()
        } else {
            message
        };
        Self { kind, message }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "Job was cancelled")
    }

    pub fn queue_rejected(reason: impl std::fmt::Display) -> Self {
        Self::new(FailureKind::QueueRejected, format!("Queue rejected job: {}", reason))
    }

    pub fn retries_exhausted(last_error: impl std::fmt::Display) -> Self {
        Self::new(
            FailureKind::RetriesExhausted,
            format!("Retries exhausted: {}", last_error),
        )
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub failure: Option<Failure>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl Job {
    pub fn new(
        owner_id: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), owner_id, job_type, payload, max_attempts)
    }

    pub fn with_id(
        id: Uuid,
        owner_id: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id: owner_id.into(),
            job_type: job_type.into(),
            payload,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            result: None,
            failure: None,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a state change in place, enforcing the job life cycle.
    ///
    /// Allowed moves:
    /// - `pending | requeued -> running` (bumps `attempts`, never past `max_attempts`)
    /// - `running -> requeued | succeeded | failed`
    /// - `pending | requeued -> failed` for administrative failures only
    ///
    /// Nothing leaves a terminal state. On error the job is left untouched.
    pub fn apply(&mut self, change: &StateChange, now: DateTime<Utc>) -> Result<()> {
        let invalid = || TaskmillError::InvalidTransition {
            id: self.id,
            from: self.state,
            to: change.to,
        };

        if let Some(expected) = change.expect_state {
            if self.state != expected {
                return Err(invalid());
            }
        }
        if let Some(expected) = change.expect_attempt {
            if self.attempts != expected {
                return Err(invalid());
            }
        }
        if self.state.is_terminal() {
            return Err(invalid());
        }

        match (self.state, change.to) {
            (JobState::Pending | JobState::Requeued, JobState::Running) => {
                if self.attempts >= self.max_attempts {
                    return Err(invalid());
                }
                self.attempts += 1;
            }
            (JobState::Running, JobState::Requeued) => {}
            (JobState::Running, JobState::Succeeded) => {
                self.result = Some(change.result.clone().unwrap_or(serde_json::Value::Null));
            }
            (JobState::Running, JobState::Failed) => {
                self.failure = Some(change.failure_or_default());
            }
            (JobState::Pending | JobState::Requeued, JobState::Failed) => {
                let failure = change.failure_or_default();
                if !failure.kind.is_administrative() {
                    return Err(invalid());
                }
                self.failure = Some(failure);
            }
            _ => return Err(invalid()),
        }

        self.state = change.to;
        self.updated_at = now;
        Ok(())
    }
}

/// A requested transition, optionally guarded by the state and attempt the
/// caller last observed.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub to: JobState,
    pub result: Option<serde_json::Value>,
    pub failure: Option<Failure>,
    pub expect_state: Option<JobState>,
    pub expect_attempt: Option<u32>,
}

impl StateChange {
    fn to(state: JobState) -> Self {
        Self {
            to: state,
            result: None,
            failure: None,
            expect_state: None,
            expect_attempt: None,
        }
    }

    pub fn running() -> Self {
        Self::to(JobState::Running)
    }

    pub fn requeued() -> Self {
        Self::to(JobState::Requeued)
    }

    pub fn succeeded(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::to(JobState::Succeeded)
        }
    }

    pub fn failed(failure: Failure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::to(JobState::Failed)
        }
    }

    pub fn expecting(mut self, state: JobState) -> Self {
        self.expect_state = Some(state);
        self
    }

    pub fn at_attempt(mut self, attempt: u32) -> Self {
        self.expect_attempt = Some(attempt);
        self
    }

    fn failure_or_default(&self) -> Failure {
        self.failure
            .clone()
            .unwrap_or_else(|| Failure::new(FailureKind::Error, "Job failed"))
    }
}
