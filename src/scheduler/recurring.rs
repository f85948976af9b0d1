use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::coordinator::{Coordinator, SubmitRequest};
use crate::scheduler::cadence::Cadence;

pub const SYSTEM_OWNER: &str = "system";

/// A job definition submitted on a fixed cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub name: String,
    pub job_type: String,
    pub owner_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub cadence: Cadence,
    pub next_due: DateTime<Utc>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl ScheduledJob {
    /// First run is one full interval from now.
    pub fn new(name: impl Into<String>, job_type: impl Into<String>, cadence: Cadence) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            owner_id: SYSTEM_OWNER.to_string(),
            payload: serde_json::json!({}),
            cadence,
            next_due: cadence.next_after(Utc::now()),
            max_attempts: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn starting_at(mut self, next_due: DateTime<Utc>) -> Self {
        self.next_due = next_due;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due <= now
    }

    fn request(&self) -> SubmitRequest {
        let mut request =
            SubmitRequest::new(&self.owner_id, &self.job_type, self.payload.clone());
        request.max_attempts = self.max_attempts;
        request
    }
}

/// Submits recurring jobs through the [`Coordinator`].
///
/// A definition fires at most once per tick. Runs missed while the process
/// was down are not replayed: after firing, the next due time is counted from
/// the tick that fired it.
pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    definitions: Mutex<Vec<ScheduledJob>>,
}

impl Scheduler {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            definitions: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ScheduledJob>> {
        self.definitions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a definition, replacing any existing one with the same name.
    pub fn add(&self, definition: ScheduledJob) {
        tracing::info!(
            name = %definition.name,
            job_type = %definition.job_type,
            cadence = %definition.cadence,
            next_due = %definition.next_due,
            "Registered recurring job"
        );
        let mut definitions = self.lock();
        definitions.retain(|d| d.name != definition.name);
        definitions.push(definition);
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut definitions = self.lock();
        let before = definitions.len();
        definitions.retain(|d| d.name != name);
        definitions.len() != before
    }

    pub fn definitions(&self) -> Vec<ScheduledJob> {
        self.lock().clone()
    }

    /// Fire every definition due at `now`. Returns the ids of submitted jobs.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let due: Vec<(String, SubmitRequest)> = {
            let mut definitions = self.lock();
            definitions
                .iter_mut()
                .filter(|d| d.is_due(now))
                .map(|d| {
                    d.next_due = d.cadence.next_after(now);
                    (d.name.clone(), d.request())
                })
                .collect()
        };

        let mut submitted = Vec::with_capacity(due.len());
        for (name, request) in due {
            match self.coordinator.submit(request).await {
                Ok(job_id) => {
                    tracing::info!(name = %name, job_id = %job_id, "Submitted recurring job");
                    submitted.push(job_id);
                }
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "Recurring job submission failed");
                }
            }
        }
        submitted
    }

    pub async fn run(&self, tick: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_at(Utc::now()).await;
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!("Scheduler stopped");
                    break;
                }
            }
        }
    }
}
