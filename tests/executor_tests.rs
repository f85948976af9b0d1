
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use taskmill::coordinator::SubmitRequest;
use taskmill::error::TaskmillError;
use taskmill::handlers::{CLEANUP, ECHO, PROCESS, SEND_EMAIL};
use taskmill::job::{FailureKind, JobState};
use test_harness::{test_config, TestEngine};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_builtin_job_types_registered() {
    let test = TestEngine::start_builtin(test_config()).await;
    assert_eq!(
        test.coordinator().registry().job_types(),
        vec![CLEANUP, ECHO, PROCESS, SEND_EMAIL]
    );
}

#[tokio::test]
async fn test_process_job_reports_every_step() {
    let test = TestEngine::start_builtin(test_config()).await;

    let id = test
        .coordinator()
        .submit(SubmitRequest::new(
            "u1",
            PROCESS,
            json!({"steps": 5, "step_ms": 20}),
        ))
        .await
        .unwrap();
    let stream = test.coordinator().subscribe(id).await.unwrap();
    let snapshots: Vec<_> = tokio::time::timeout(WAIT, stream.collect::<Vec<_>>())
        .await
        .unwrap();

    let last = snapshots.last().expect("at least one snapshot");
    assert_eq!(last.total, Some(5));
    assert!(last.message.starts_with("Processing step"));

    let job = test.wait_for_terminal(id, WAIT).await;
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(
        job.result,
        Some(json!({"status": "completed", "result": "Task finished successfully"}))
    );
}

#[tokio::test]
async fn test_process_job_stops_on_cancel() {
    let test = TestEngine::start_builtin(test_config()).await;

    let id = test
        .coordinator()
        .submit(SubmitRequest::new(
            "u1",
            PROCESS,
            json!({"steps": 1000, "step_ms": 20}),
        ))
        .await
        .unwrap();
    test.wait_for(id, JobState::Running, WAIT).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    test.coordinator().cancel(id).await.unwrap();
    let job = test.wait_for_terminal(id, Duration::from_secs(1)).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure.unwrap().kind, FailureKind::Cancelled);
}

#[tokio::test]
async fn test_process_payload_validated_at_submission() {
    let test = TestEngine::start_builtin(test_config()).await;

    let err = test
        .coordinator()
        .submit(SubmitRequest::new("u1", PROCESS, json!({"steps": 50_000})))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskmillError::InvalidPayload { ref job_type, .. } if job_type == PROCESS));
}

#[tokio::test]
async fn test_send_email_job() {
    let test = TestEngine::start_builtin(test_config()).await;

    let id = test
        .coordinator()
        .submit(SubmitRequest::new(
            "u1",
            SEND_EMAIL,
            json!({
                "email": "someone@example.com",
                "subject": "Weekly report",
                "body": "All green.",
                "delay_ms": 10,
            }),
        ))
        .await
        .unwrap();

    let job = test.wait_for_terminal(id, WAIT).await;
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(
        job.result,
        Some(json!({"status": "sent", "email": "someone@example.com"}))
    );
}

#[tokio::test]
async fn test_send_email_rejects_bad_address() {
    let test = TestEngine::start_builtin(test_config()).await;

    let err = test
        .coordinator()
        .submit(SubmitRequest::new(
            "u1",
            SEND_EMAIL,
            json!({"email": "nobody", "subject": "x", "body": "y"}),
        ))
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(test.store.is_empty().await);
}

#[tokio::test]
async fn test_echo_rejects_non_object_payload() {
    let test = TestEngine::start_builtin(test_config()).await;

    let err = test
        .coordinator()
        .submit(SubmitRequest::new("u1", ECHO, json!([1, 2, 3])))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskmillError::InvalidPayload { .. }));
}

#[tokio::test]
async fn test_cleanup_purges_finished_jobs() {
    let mut config = test_config();
    config.retention_secs = 0;
    let test = TestEngine::start_builtin(config).await;

    let mut finished = Vec::new();
    for n in 0..3 {
        let id = test
            .coordinator()
            .submit(SubmitRequest::new("u1", ECHO, json!({"n": n})))
            .await
            .unwrap();
        test.wait_for_terminal(id, WAIT).await;
        finished.push(id);
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let cleanup = test
        .coordinator()
        .submit(SubmitRequest::new("system", CLEANUP, json!({})))
        .await
        .unwrap();
    let job = test.wait_for_terminal(cleanup, WAIT).await;
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.result, Some(json!({"cleaned": 3})));

    for id in finished {
        assert!(matches!(
            test.coordinator().status(id).await,
            Err(TaskmillError::JobNotFound(_))
        ));
    }
}
