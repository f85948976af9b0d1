
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use taskmill::job::JobState;
use taskmill::scheduler::{Cadence, ScheduledJob, SYSTEM_OWNER};
use taskmill::worker::HandlerRegistry;
use test_harness::{assert_eventually, test_config, StrictEchoHandler, TestEngine};

fn registry() -> HandlerRegistry {
    HandlerRegistry::new().with("echo", StrictEchoHandler)
}

#[tokio::test]
async fn test_due_definition_fires_once() {
    let test = TestEngine::build(test_config(), registry());
    let scheduler = test.engine.scheduler();
    let now = Utc::now();

    scheduler.add(
        ScheduledJob::new("report", "echo", Cadence::hourly())
            .with_payload(json!({"n": 1}))
            .starting_at(now),
    );

    let fired = scheduler.tick_at(now).await;
    assert_eq!(fired.len(), 1);

    // Same instant again: already advanced.
    assert!(scheduler.tick_at(now).await.is_empty());

    let job = test.job(fired[0]).await;
    assert_eq!(job.job_type, "echo");
    assert_eq!(job.owner_id, SYSTEM_OWNER);
    assert_eq!(job.payload, json!({"n": 1}));
    assert_eq!(job.state, JobState::Pending);
}

#[tokio::test]
async fn test_not_due_definition_does_not_fire() {
    let test = TestEngine::build(test_config(), registry());
    let scheduler = test.engine.scheduler();
    let now = Utc::now();

    scheduler.add(
        ScheduledJob::new("later", "echo", Cadence::hourly())
            .with_payload(json!({"n": 1}))
            .starting_at(now + ChronoDuration::minutes(5)),
    );

    assert!(scheduler.tick_at(now).await.is_empty());
    assert!(test.engine.queue().is_empty());
}

#[tokio::test]
async fn test_missed_runs_are_not_replayed() {
    let test = TestEngine::build(test_config(), registry());
    let scheduler = test.engine.scheduler();
    let start = Utc::now();

    scheduler.add(
        ScheduledJob::new("hourly", "echo", Cadence::hourly())
            .with_payload(json!({"n": 1}))
            .starting_at(start),
    );

    // Five hours of downtime, then a burst of ticks.
    let resumed = start + ChronoDuration::hours(5);
    let mut fired = 0;
    for offset in 0..10 {
        fired += scheduler
            .tick_at(resumed + ChronoDuration::seconds(offset))
            .await
            .len();
    }
    assert_eq!(fired, 1);

    let definition = &scheduler.definitions()[0];
    assert_eq!(definition.next_due, resumed + ChronoDuration::hours(1));

    // The next run comes one interval after the tick that fired.
    assert!(scheduler
        .tick_at(resumed + ChronoDuration::minutes(59))
        .await
        .is_empty());
    assert_eq!(
        scheduler
            .tick_at(resumed + ChronoDuration::hours(1))
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_failed_submission_still_advances() {
    let test = TestEngine::build(test_config(), registry());
    let scheduler = test.engine.scheduler();
    let now = Utc::now();

    // Payload rejected by the handler.
    scheduler.add(
        ScheduledJob::new("bad", "echo", Cadence::every(Duration::from_secs(60)).unwrap())
            .with_payload(json!({"n": "x"}))
            .starting_at(now),
    );

    assert!(scheduler.tick_at(now).await.is_empty());
    assert!(scheduler.definitions()[0].next_due > now);
    assert!(test.store.is_empty().await);
}

#[tokio::test]
async fn test_add_replaces_definition_with_same_name() {
    let test = TestEngine::build(test_config(), registry());
    let scheduler = test.engine.scheduler();

    scheduler.add(ScheduledJob::new("job", "echo", Cadence::hourly()));
    scheduler.add(ScheduledJob::new("job", "echo", Cadence::daily()));
    scheduler.add(ScheduledJob::new("other", "echo", Cadence::hourly()));

    let definitions = scheduler.definitions();
    assert_eq!(definitions.len(), 2);
    let job = definitions.iter().find(|d| d.name == "job").unwrap();
    assert_eq!(job.cadence, Cadence::daily());

    assert!(scheduler.remove("other"));
    assert!(!scheduler.remove("other"));
    assert_eq!(scheduler.definitions().len(), 1);
}

#[tokio::test]
async fn test_scheduled_jobs_run_through_workers() {
    let test = TestEngine::start(test_config(), registry()).await;

    test.engine.scheduler().add(
        ScheduledJob::new("fast", "echo", Cadence::every(Duration::from_millis(100)).unwrap())
            .with_payload(json!({"n": 7}))
            .with_owner("cron")
            .starting_at(Utc::now()),
    );

    let store = test.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move {
                use taskmill::store::JobStore;
                let jobs = store.list_by_owner("cron").await.unwrap();
                jobs.iter().filter(|j| j.state == JobState::Succeeded).count() >= 2
            }
        },
        Duration::from_secs(5),
        "recurring job should run repeatedly",
    )
    .await;
}

#[test]
fn test_cadence_serde_uses_descriptor() {
    let definition = ScheduledJob::new("cleanup", "cleanup", Cadence::hourly());
    let value = serde_json::to_value(&definition).unwrap();
    assert_eq!(value["cadence"], json!("@hourly"));

    let parsed: ScheduledJob = serde_json::from_value(json!({
        "name": "digest",
        "job_type": "send_email",
        "owner_id": "system",
        "cadence": "@every 1h30m",
        "next_due": "2030-01-01T00:00:00Z",
    }))
    .unwrap();
    assert_eq!(parsed.cadence.interval(), Duration::from_secs(90 * 60));
    assert_eq!(parsed.payload, serde_json::Value::Null);

    let bad = serde_json::from_value::<ScheduledJob>(json!({
        "name": "x",
        "job_type": "echo",
        "owner_id": "system",
        "cadence": "*/5 * * * *",
        "next_due": "2030-01-01T00:00:00Z",
    }));
    assert!(bad.is_err());
}
