pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod job;
pub mod notify;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use coordinator::{Coordinator, JobStatusView, SubmitRequest};
pub use engine::Engine;
pub use error::{Result, TaskmillError};
pub use job::{Failure, FailureKind, Job, JobState};
