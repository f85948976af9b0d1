//! Job execution.
//!
//! - [`JobHandler`]: the capability a job type plugs in (`validate` + `execute`)
//! - [`HandlerRegistry`]: handlers keyed by job-type tag, fixed at startup
//! - [`JobExecutor`]: claim -> `running` -> body -> terminal state or retry
//! - [`WorkerPool`]: resizable set of units competing for queue entries
//! - [`ClaimReaper`]: re-queues claims whose visibility timeout expired
//!
//! # Execution Flow
//!
//! 1. A unit dequeues a [`Claim`](crate::queue::Claim)
//! 2. The job is marked `running` and its attempt count bumped
//! 3. The handler runs while a heartbeat keeps the claim visible
//! 4. The outcome is recorded: `succeeded`, `failed`, or `requeued` with backoff
//!
//! Panics in a handler are caught and recorded as a failure; they never take
//! the unit down.

pub mod executor;
pub mod handler;
pub mod heartbeat;
pub mod pool;
pub mod reaper;

pub use executor::{ExecutionResult, JobExecutor, RunningJobs};
pub use handler::{ExecError, HandlerRegistry, JobContext, JobHandler};
pub use pool::WorkerPool;
pub use reaper::ClaimReaper;
