use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use uuid::Uuid;

use taskmill::error::TaskmillError;
use taskmill::job::{Failure, FailureKind, Job, JobState, StateChange};
use taskmill::store::{FileJobStore, JobStore, MemoryJobStore};

fn echo_job(owner: &str) -> Job {
    Job::new(owner, "echo", json!({"n": 1}), 3)
}

async fn exercise_lifecycle(store: &dyn JobStore) {
    let id = store.create(echo_job("alice")).await.unwrap();

    let job = store.update_state(id, StateChange::running()).await.unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.attempts, 1);

    let job = store
        .update_state(id, StateChange::succeeded(json!({"ok": true})))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.result, Some(json!({"ok": true})));

    let stored = store.get(id).await.unwrap();
    assert_eq!(stored.state, JobState::Succeeded);
    assert!(stored.updated_at >= stored.created_at);
}

#[tokio::test]
async fn test_memory_store_lifecycle() {
    let store = MemoryJobStore::new();
    exercise_lifecycle(&store).await;
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_file_store_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileJobStore::open(dir.path().join("jobs.json")).await.unwrap();
    exercise_lifecycle(&store).await;
}

#[tokio::test]
async fn test_duplicate_id_rejected() {
    let store = MemoryJobStore::new();
    let job = echo_job("alice");
    let copy = job.clone();

    store.create(job).await.unwrap();
    let err = store.create(copy).await.unwrap_err();
    assert!(matches!(err, TaskmillError::DuplicateId(_)));
}

#[tokio::test]
async fn test_unknown_job_not_found() {
    let store = MemoryJobStore::new();
    let id = Uuid::new_v4();

    assert!(matches!(
        store.get(id).await,
        Err(TaskmillError::JobNotFound(missing)) if missing == id
    ));
    assert!(matches!(
        store.update_state(id, StateChange::running()).await,
        Err(TaskmillError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_terminal_state_is_final() {
    let store = MemoryJobStore::new();
    let id = store.create(echo_job("alice")).await.unwrap();
    store.update_state(id, StateChange::running()).await.unwrap();
    store
        .update_state(id, StateChange::succeeded(json!(null)))
        .await
        .unwrap();

    for change in [
        StateChange::running(),
        StateChange::requeued(),
        StateChange::failed(Failure::cancelled()),
        StateChange::succeeded(json!(1)),
    ] {
        let err = store.update_state(id, change).await.unwrap_err();
        assert!(matches!(
            err,
            TaskmillError::InvalidTransition {
                from: JobState::Succeeded,
                ..
            }
        ));
    }

    let job = store.get(id).await.unwrap();
    assert_eq!(job.result, Some(json!(null)));
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_guarded_update_rejects_stale_writer() {
    let store = MemoryJobStore::new();
    let id = store.create(echo_job("alice")).await.unwrap();

    // Attempt 1 runs and is handed back.
    store.update_state(id, StateChange::running()).await.unwrap();
    store.update_state(id, StateChange::requeued()).await.unwrap();

    // Attempt 2 starts.
    store.update_state(id, StateChange::running()).await.unwrap();

    // A late outcome from attempt 1 must not land.
    let stale = StateChange::succeeded(json!("late"))
        .expecting(JobState::Running)
        .at_attempt(1);
    assert!(matches!(
        store.update_state(id, stale).await,
        Err(TaskmillError::InvalidTransition { .. })
    ));

    let current = StateChange::succeeded(json!("fresh"))
        .expecting(JobState::Running)
        .at_attempt(2);
    let job = store.update_state(id, current).await.unwrap();
    assert_eq!(job.result, Some(json!("fresh")));
}

#[tokio::test]
async fn test_attempts_never_exceed_max() {
    let store = MemoryJobStore::new();
    let id = store
        .create(Job::new("alice", "echo", json!({}), 1))
        .await
        .unwrap();

    store.update_state(id, StateChange::running()).await.unwrap();
    store.update_state(id, StateChange::requeued()).await.unwrap();

    assert!(store.update_state(id, StateChange::running()).await.is_err());
    assert_eq!(store.get(id).await.unwrap().attempts, 1);
}

#[tokio::test]
async fn test_pending_job_only_fails_administratively() {
    let store = MemoryJobStore::new();
    let id = store.create(echo_job("alice")).await.unwrap();

    let ordinary = StateChange::failed(Failure::new(FailureKind::Error, "boom"));
    assert!(store.update_state(id, ordinary).await.is_err());

    let job = store
        .update_state(id, StateChange::failed(Failure::cancelled()))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.failure.unwrap().kind, FailureKind::Cancelled);
}

#[tokio::test]
async fn test_list_by_owner_newest_first() {
    let store = MemoryJobStore::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(store.create(echo_job("alice")).await.unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    store.create(echo_job("bob")).await.unwrap();

    let listed: Vec<Uuid> = store
        .list_by_owner("alice")
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    ids.reverse();
    assert_eq!(listed, ids);

    assert!(store.list_by_owner("carol").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_unfinished_skips_terminal() {
    let store = MemoryJobStore::new();
    let done = store.create(echo_job("alice")).await.unwrap();
    let waiting = store.create(echo_job("alice")).await.unwrap();
    store.update_state(done, StateChange::running()).await.unwrap();
    store
        .update_state(done, StateChange::succeeded(json!({})))
        .await
        .unwrap();

    let unfinished = store.list_unfinished().await.unwrap();
    assert_eq!(unfinished.len(), 1);
    assert_eq!(unfinished[0].id, waiting);
}

#[tokio::test]
async fn test_purge_finished_respects_cutoff() {
    let store = MemoryJobStore::new();
    let done = store.create(echo_job("alice")).await.unwrap();
    let open = store.create(echo_job("alice")).await.unwrap();
    store
        .update_state(done, StateChange::failed(Failure::cancelled()))
        .await
        .unwrap();

    // Nothing finished before an hour ago.
    let removed = store
        .purge_finished(Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(removed, 0);

    let removed = store
        .purge_finished(Utc::now() + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.get(done).await.is_err());
    assert!(store.get(open).await.is_ok());
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.json");

    let (finished, queued) = {
        let store = FileJobStore::open(&path).await.unwrap();
        let finished = store.create(echo_job("alice")).await.unwrap();
        let queued = store.create(echo_job("bob")).await.unwrap();
        store
            .update_state(finished, StateChange::running())
            .await
            .unwrap();
        store
            .update_state(finished, StateChange::succeeded(json!({"n": 1})))
            .await
            .unwrap();
        (finished, queued)
    };

    let reopened = FileJobStore::open(&path).await.unwrap();
    let job = reopened.get(finished).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.result, Some(json!({"n": 1})));
    assert_eq!(job.attempts, 1);

    let unfinished = reopened.list_unfinished().await.unwrap();
    assert_eq!(unfinished.len(), 1);
    assert_eq!(unfinished[0].id, queued);
}

#[tokio::test]
async fn test_file_store_rolls_back_on_write_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.json");
    let store = Arc::new(FileJobStore::open(&path).await.unwrap());
    let id = store.create(echo_job("alice")).await.unwrap();

    // Replace the file with a directory so the atomic rename fails.
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();

    let err = store
        .update_state(id, StateChange::running())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskmillError::Storage(_)));

    let job = store.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn test_concurrent_updates_apply_once() {
    let store = Arc::new(MemoryJobStore::new());
    let id = store.create(echo_job("alice")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .update_state(
                    id,
                    StateChange::running()
                        .expecting(JobState::Pending)
                        .at_attempt(0),
                )
                .await
                .is_ok()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.get(id).await.unwrap().attempts, 1);
}
