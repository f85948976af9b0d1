//! Authoritative job records.
//!
//! Every state change goes through [`JobStore::update_state`], which applies
//! the change atomically per job and enforces the life cycle implemented by
//! [`Job::apply`]. Backends:
//!
//! - [`MemoryJobStore`]: process-local map, lost on restart
//! - [`FileJobStore`]: same semantics, persisted to a JSON file after every mutation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{Job, StateChange};

pub mod file;
pub mod memory;

pub use file::FileJobStore;
pub use memory::MemoryJobStore;

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a new record. Fails with `DuplicateId` if the id is taken.
    async fn create(&self, job: Job) -> Result<Uuid>;

    async fn get(&self, id: Uuid) -> Result<Job>;

    /// Apply a state change and return the updated record.
    async fn update_state(&self, id: Uuid, change: StateChange) -> Result<Job>;

    /// Jobs of one owner, newest first.
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Job>>;

    /// Every job not yet in a terminal state, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<Job>>;

    /// Delete terminal jobs last updated before `before`. Returns how many were removed.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize>;
}

pub(crate) fn newest_first(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    jobs
}

pub(crate) fn oldest_first(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by_key(|j| j.created_at);
    jobs
}
