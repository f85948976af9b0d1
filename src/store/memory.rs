use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, TaskmillError};
use crate::job::{Job, StateChange};
use crate::store::{newest_first, oldest_first, JobStore};

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<Uuid> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(TaskmillError::DuplicateId(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TaskmillError::JobNotFound(id))
    }

    async fn update_state(&self, id: Uuid, change: StateChange) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(TaskmillError::JobNotFound(id))?;
        job.apply(&change, Utc::now())?;
        Ok(job.clone())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        Ok(newest_first(
            jobs.values()
                .filter(|j| j.owner_id == owner_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        Ok(oldest_first(
            jobs.values().filter(|j| !j.is_terminal()).cloned().collect(),
        ))
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.jobs.write().await;
        let count = jobs.len();
        jobs.retain(|_, job| !(job.is_terminal() && job.updated_at < before));
        Ok(count - jobs.len())
    }
}
