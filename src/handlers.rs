//! Job types available out of the box.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::scheduler::{Cadence, ScheduledJob};
use crate::store::JobStore;
use crate::worker::{ExecError, HandlerRegistry, JobContext, JobHandler};

pub const ECHO: &str = "echo";
pub const PROCESS: &str = "process";
pub const SEND_EMAIL: &str = "send_email";
pub const CLEANUP: &str = "cleanup";

const MAX_PROCESS_STEPS: u64 = 10_000;

fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, String> {
    serde_json::from_value(payload.clone()).map_err(|e| e.to_string())
}

/// Registry with every built-in job type.
pub fn builtin_registry(store: Arc<dyn JobStore>, retention: Duration) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(ECHO, EchoHandler)
        .with(PROCESS, ProcessHandler)
        .with(SEND_EMAIL, EmailHandler)
        .with(CLEANUP, CleanupHandler::new(store, retention))
}

/// Hourly purge of finished jobs.
pub fn cleanup_schedule() -> ScheduledJob {
    ScheduledJob::new("cleanup", CLEANUP, Cadence::hourly())
}

/// Returns its object payload unchanged.
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        if payload.is_object() {
            Ok(())
        } else {
            Err("payload must be a JSON object".to_string())
        }
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, ExecError> {
        Ok(ctx.payload)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessPayload {
    #[serde(default = "default_steps")]
    steps: u64,
    #[serde(default = "default_step_ms")]
    step_ms: u64,
}

fn default_steps() -> u64 {
    100
}

fn default_step_ms() -> u64 {
    100
}

/// Simulated long-running work reporting one snapshot per step.
pub struct ProcessHandler;

#[async_trait]
impl JobHandler for ProcessHandler {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        let p: ProcessPayload = parse(payload)?;
        if p.steps == 0 || p.steps > MAX_PROCESS_STEPS {
            return Err(format!("steps must be between 1 and {}", MAX_PROCESS_STEPS));
        }
        Ok(())
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, ExecError> {
        let p: ProcessPayload = parse(&ctx.payload).map_err(ExecError::Fatal)?;
        let step = Duration::from_millis(p.step_ms);

        for i in 1..=p.steps {
            ctx.check_cancelled()?;
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = ctx.cancelled() => return Err(ExecError::Cancelled),
            }
            ctx.report(i, Some(p.steps), format!("Processing step {}", i));
        }

        Ok(json!({
            "status": "completed",
            "result": "Task finished successfully",
        }))
    }
}

#[derive(Debug, Deserialize)]
struct EmailPayload {
    email: String,
    subject: String,
    body: String,
    #[serde(default = "default_delivery_ms")]
    delay_ms: u64,
}

fn default_delivery_ms() -> u64 {
    2_000
}

/// Simulated email delivery.
pub struct EmailHandler;

#[async_trait]
impl JobHandler for EmailHandler {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        let p: EmailPayload = parse(payload)?;
        match p.email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
            _ => return Err(format!("invalid email address: {}", p.email)),
        }
        if p.subject.trim().is_empty() {
            return Err("subject must not be empty".to_string());
        }
        Ok(())
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, ExecError> {
        let p: EmailPayload = parse(&ctx.payload).map_err(ExecError::Fatal)?;

        ctx.report(0, Some(1), format!("Sending email to {}", p.email));
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(p.delay_ms)) => {}
            _ = ctx.cancelled() => return Err(ExecError::Cancelled),
        }
        tracing::info!(
            job_id = %ctx.job_id,
            email = %p.email,
            subject = %p.subject,
            body_len = p.body.len(),
            "Email sent"
        );
        ctx.report(1, Some(1), "Email sent");

        Ok(json!({ "status": "sent", "email": p.email }))
    }
}

/// Removes finished jobs older than the retention window.
pub struct CleanupHandler {
    store: Arc<dyn JobStore>,
    retention: Duration,
}

impl CleanupHandler {
    pub fn new(store: Arc<dyn JobStore>, retention: Duration) -> Self {
        Self { store, retention }
    }
}

#[async_trait]
impl JobHandler for CleanupHandler {
    async fn execute(&self, ctx: JobContext) -> Result<Value, ExecError> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| ExecError::fatal(format!("retention out of range: {}", e)))?;
        let cutoff = Utc::now() - retention;

        let cleaned = self
            .store
            .purge_finished(cutoff)
            .await
            .map_err(|e| ExecError::recoverable(e.to_string()))?;

        tracing::info!(job_id = %ctx.job_id, cleaned, "Purged finished jobs");
        Ok(json!({ "cleaned": cleaned }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_requires_object() {
        assert!(EchoHandler.validate(&json!({"n": 5})).is_ok());
        assert!(EchoHandler.validate(&json!([1, 2])).is_err());
        assert!(EchoHandler.validate(&json!("text")).is_err());
    }

    #[test]
    fn process_bounds_steps() {
        assert!(ProcessHandler.validate(&json!({})).is_ok());
        assert!(ProcessHandler.validate(&json!({"steps": 10, "step_ms": 1})).is_ok());
        assert!(ProcessHandler.validate(&json!({"steps": 0})).is_err());
        assert!(ProcessHandler.validate(&json!({"steps": 10_001})).is_err());
        assert!(ProcessHandler.validate(&json!({"steps": "many"})).is_err());
        assert!(ProcessHandler.validate(&json!({"stepz": 3})).is_err());
    }

    #[test]
    fn email_requires_address_and_subject() {
        let ok = json!({"email": "a@example.com", "subject": "hi", "body": "hello"});
        assert!(EmailHandler.validate(&ok).is_ok());

        let no_at = json!({"email": "example.com", "subject": "hi", "body": ""});
        assert!(EmailHandler.validate(&no_at).is_err());

        let blank_subject = json!({"email": "a@example.com", "subject": " ", "body": ""});
        assert!(EmailHandler.validate(&blank_subject).is_err());

        assert!(EmailHandler.validate(&json!({"email": "a@example.com"})).is_err());
    }
}
