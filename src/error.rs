use thiserror::Error;
use uuid::Uuid;

use crate::job::JobState;

#[derive(Error, Debug)]
pub enum TaskmillError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job id already exists: {0}")]
    DuplicateId(Uuid),

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Invalid payload for job type {job_type}: {reason}")]
    InvalidPayload { job_type: String, reason: String },

    #[error("Queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("Queue rejected job {0}")]
    QueueRejected(Uuid),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Job {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TaskmillError {
    /// Validation errors are rejected at submission and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TaskmillError::UnknownJobType(_) | TaskmillError::InvalidPayload { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TaskmillError>;
