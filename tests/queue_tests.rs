use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskmill::error::TaskmillError;
use taskmill::queue::{JobQueue, QueueEntry};

fn entry() -> QueueEntry {
    QueueEntry::new(Uuid::new_v4(), "echo")
}

fn small_queue(capacity: usize) -> JobQueue {
    JobQueue::with_capacity(capacity, Duration::from_millis(100))
}

#[tokio::test]
async fn test_dequeue_is_fifo() {
    let queue = small_queue(10);
    let stop = CancellationToken::new();
    let entries: Vec<QueueEntry> = (0..5).map(|_| entry()).collect();
    for e in &entries {
        queue.enqueue(e.clone()).unwrap();
    }

    for expected in &entries {
        let claim = queue.dequeue(&stop).await.unwrap();
        assert_eq!(claim.job_id(), expected.job_id);
        assert!(queue.ack(&claim));
    }
    assert!(queue.is_empty());
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn test_enqueue_rejects_when_full() {
    let queue = small_queue(2);
    queue.enqueue(entry()).unwrap();
    queue.enqueue(entry()).unwrap();
    assert!(queue.is_full());

    let err = queue.enqueue(entry()).unwrap_err();
    assert!(matches!(err, TaskmillError::QueueFull(2)));
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn test_claimed_entries_free_capacity() {
    let queue = small_queue(1);
    let stop = CancellationToken::new();
    queue.enqueue(entry()).unwrap();

    let _claim = queue.dequeue(&stop).await.unwrap();
    assert_eq!(queue.len(), 0);
    queue.enqueue(entry()).unwrap();
}

#[tokio::test]
async fn test_requeue_bypasses_capacity() {
    let queue = small_queue(1);
    queue.enqueue(entry()).unwrap();
    queue.requeue(entry(), Duration::ZERO);
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn test_dequeue_waits_for_enqueue() {
    let queue = Arc::new(small_queue(10));
    let stop = CancellationToken::new();
    let e = entry();

    let waiter = {
        let queue = queue.clone();
        let stop = stop.clone();
        tokio::spawn(async move { queue.dequeue(&stop).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    queue.enqueue(e.clone()).unwrap();
    let claim = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("dequeue should wake up")
        .unwrap()
        .unwrap();
    assert_eq!(claim.job_id(), e.job_id);
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let queue = Arc::new(JobQueue::with_capacity(1_000, Duration::from_secs(30)));
    let stop = CancellationToken::new();
    let total = 200;
    for _ in 0..total {
        queue.enqueue(entry()).unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        let stop = stop.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while !queue.is_empty() {
                match tokio::time::timeout(Duration::from_millis(20), queue.dequeue(&stop)).await {
                    Ok(Ok(claim)) => {
                        claimed.push(claim.job_id());
                        queue.ack(&claim);
                    }
                    _ => break,
                }
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut count = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {} claimed twice", id);
            count += 1;
        }
    }
    assert_eq!(count, total);
}

#[tokio::test]
async fn test_stop_token_interrupts_dequeue() {
    let queue = Arc::new(small_queue(10));
    let stop = CancellationToken::new();

    let waiter = {
        let queue = queue.clone();
        let stop = stop.clone();
        tokio::spawn(async move { queue.dequeue(&stop).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    stop.cancel();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(TaskmillError::Cancelled)));
}

#[tokio::test]
async fn test_close_rejects_enqueue_and_dequeue() {
    let queue = small_queue(10);
    queue.enqueue(entry()).unwrap();
    queue.close();

    assert!(queue.is_closed());
    assert!(matches!(queue.enqueue(entry()), Err(TaskmillError::Cancelled)));
    assert!(matches!(
        queue.dequeue(&CancellationToken::new()).await,
        Err(TaskmillError::Cancelled)
    ));
}

#[tokio::test]
async fn test_unacked_claim_expires() {
    let queue = small_queue(10);
    let stop = CancellationToken::new();
    let e = entry();
    queue.enqueue(e.clone()).unwrap();

    let claim = queue.dequeue(&stop).await.unwrap();
    assert!(queue.take_expired(Instant::now()).is_empty());

    let expired = queue.take_expired(Instant::now() + Duration::from_millis(150));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].job_id, e.job_id);

    // The original holder no longer owns the claim.
    assert!(!queue.ack(&claim));
    assert!(!queue.touch(&claim));
}

#[tokio::test]
async fn test_touch_extends_visibility() {
    let queue = small_queue(10);
    let stop = CancellationToken::new();
    queue.enqueue(entry()).unwrap();
    let claim = queue.dequeue(&stop).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(queue.touch(&claim));

    // 60ms after the touch the original deadline has passed but the new one has not.
    let later = Instant::now() + Duration::from_millis(60);
    assert!(queue.take_expired(later).is_empty());
    assert!(queue.ack(&claim));
}

#[tokio::test]
async fn test_delayed_requeue_becomes_visible_after_delay() {
    let queue = small_queue(10);
    let stop = CancellationToken::new();
    let e = entry();

    let started = Instant::now();
    queue.requeue(e.clone(), Duration::from_millis(80));
    assert_eq!(queue.len(), 1);

    let claim = queue.dequeue(&stop).await.unwrap();
    assert_eq!(claim.job_id(), e.job_id);
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn test_delayed_entry_does_not_block_ready_ones() {
    let queue = small_queue(10);
    let stop = CancellationToken::new();
    let delayed = entry();
    let ready = entry();

    queue.requeue(delayed.clone(), Duration::from_secs(60));
    queue.enqueue(ready.clone()).unwrap();

    let claim = queue.dequeue(&stop).await.unwrap();
    assert_eq!(claim.job_id(), ready.job_id);
}

#[tokio::test]
async fn test_void_removes_ready_and_delayed_entries() {
    let queue = small_queue(10);
    let stop = CancellationToken::new();
    let a = entry();
    let b = entry();
    let c = entry();
    queue.enqueue(a.clone()).unwrap();
    queue.requeue(b.clone(), Duration::from_secs(60));
    queue.enqueue(c.clone()).unwrap();

    assert!(queue.void(a.job_id));
    assert!(queue.void(b.job_id));
    assert!(!queue.void(Uuid::new_v4()));
    assert_eq!(queue.len(), 1);

    let claim = queue.dequeue(&stop).await.unwrap();
    assert_eq!(claim.job_id(), c.job_id);
}
