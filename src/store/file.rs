use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Result, TaskmillError};
use crate::job::{Job, StateChange};
use crate::store::{newest_first, oldest_first, JobStore};

/// Job store persisted as a single JSON document.
///
/// Every mutation rewrites the whole file through a temporary sibling and an
/// atomic rename. If the write fails the in-memory change is rolled back and
/// the caller receives [`TaskmillError::Storage`], so a state update is never
/// acknowledged without being durable.
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl FileJobStore {
    /// Open the store at `path`, loading existing records if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let jobs = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let records: Vec<Job> = serde_json::from_slice(&bytes)?;
                records.into_iter().map(|j| (j.id, j)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(path = %path.display(), jobs = jobs.len(), "Opened job store");

        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, jobs: &HashMap<Uuid, Job>) -> Result<()> {
        let records = oldest_first(jobs.values().cloned().collect());
        let bytes = serde_json::to_vec_pretty(&records)?;

        let tmp = self.path.with_extension("tmp");
        let write = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        write.await.map_err(|e| {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to persist job store");
            TaskmillError::Storage(format!("{}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: Job) -> Result<Uuid> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(TaskmillError::DuplicateId(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        if let Err(e) = self.persist(&jobs).await {
            jobs.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Job> {
        self.jobs
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(TaskmillError::JobNotFound(id))
    }

    async fn update_state(&self, id: Uuid, change: StateChange) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(TaskmillError::JobNotFound(id))?;
        let previous = job.clone();
        job.apply(&change, Utc::now())?;
        let updated = job.clone();

        if let Err(e) = self.persist(&jobs).await {
            jobs.insert(id, previous);
            return Err(e);
        }
        Ok(updated)
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        Ok(newest_first(
            jobs.values()
                .filter(|j| j.owner_id == owner_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        Ok(oldest_first(
            jobs.values().filter(|j| !j.is_terminal()).cloned().collect(),
        ))
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.jobs.lock().await;
        let removed: Vec<Job> = jobs
            .values()
            .filter(|j| j.is_terminal() && j.updated_at < before)
            .cloned()
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }
        for job in &removed {
            jobs.remove(&job.id);
        }
        if let Err(e) = self.persist(&jobs).await {
            for job in removed {
                jobs.insert(job.id, job);
            }
            return Err(e);
        }
        Ok(removed.len())
    }
}
