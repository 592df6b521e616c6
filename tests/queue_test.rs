use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mealsync::{
    CapturePayload, CaptureRecord, FailureInfo, MealSyncError, NutritionItem, QueueConfig,
    RecordStore, StoreConfig, SyncQueue, SyncState, SyncStatus,
};

fn queue(dir: &tempfile::TempDir, config: QueueConfig) -> SyncQueue {
    let store = Arc::new(RecordStore::open(&StoreConfig::new(dir.path())).unwrap());
    SyncQueue::new(store, config)
}

fn record(id: &str, age: chrono::Duration) -> CaptureRecord {
    let mut record = CaptureRecord::with_id(
        id,
        CapturePayload::Items {
            items: vec![NutritionItem::new("oats").calories(150.0)],
        },
    );
    record.created_at = Utc::now() - age;
    record
}

fn fail(queue: &SyncQueue, id: &str, error: MealSyncError, ago: chrono::Duration) {
    let reason = FailureInfo::from_error(&error, Utc::now() - ago);
    queue
        .store()
        .update(id, |r| {
            r.transition(SyncState::Failed { reason }, Utc::now());
        })
        .unwrap();
}

#[test]
fn next_returns_oldest_pending_first() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(&dir, QueueConfig::default());
    queue.enqueue(record("young", chrono::Duration::minutes(1))).unwrap();
    queue.enqueue(record("old", chrono::Duration::minutes(20))).unwrap();

    assert_eq!(queue.next().unwrap().record.id, "old");
    assert_eq!(queue.next().unwrap().record.id, "young");
    assert!(queue.next().is_none());
}

#[test]
fn claimed_record_is_not_handed_out_twice() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(&dir, QueueConfig::default());
    queue.enqueue(record("only", chrono::Duration::zero())).unwrap();

    let claimed = queue.next().unwrap();
    assert!(queue.is_claimed("only"));
    assert!(queue.next().is_none());

    assert!(queue.ack(&claimed.record.id, claimed.claim));
    assert!(!queue.is_claimed("only"));
    // Still pending in the store, so it can be claimed again.
    assert!(queue.next().is_some());
}

#[test]
fn enqueue_rejects_non_pending_records() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(&dir, QueueConfig::default());
    let mut synced = record("done", chrono::Duration::zero());
    synced.transition(SyncState::Synced, Utc::now());
    assert!(matches!(
        queue.enqueue(synced),
        Err(MealSyncError::InvalidInput(_))
    ));
}

#[test]
fn failed_records_wait_for_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(
        &dir,
        QueueConfig::new().failed_cooldown(Duration::from_secs(300)),
    );
    queue.enqueue(record("recent", chrono::Duration::minutes(5))).unwrap();
    queue.enqueue(record("rested", chrono::Duration::minutes(1))).unwrap();

    let timeout = MealSyncError::Timeout(Duration::from_secs(30));
    fail(&queue, "recent", timeout, chrono::Duration::seconds(10));
    let timeout = MealSyncError::Timeout(Duration::from_secs(30));
    fail(&queue, "rested", timeout, chrono::Duration::minutes(10));

    assert_eq!(queue.next().unwrap().record.id, "rested");
    assert!(queue.next().is_none());
}

#[test]
fn permanently_rejected_records_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(&dir, QueueConfig::new().failed_cooldown(Duration::ZERO));
    queue.enqueue(record("bad", chrono::Duration::zero())).unwrap();
    fail(
        &queue,
        "bad",
        MealSyncError::InvalidInput("not an image".into()),
        chrono::Duration::hours(1),
    );
    assert!(queue.next().is_none());
}

#[test]
fn cancel_fires_the_claim_token() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(&dir, QueueConfig::default());
    queue.enqueue(record("r", chrono::Duration::zero())).unwrap();

    let claimed = queue.next().unwrap();
    assert!(!claimed.cancel.is_cancelled());
    assert!(queue.cancel("r"));
    assert!(claimed.cancel.is_cancelled());
    assert!(!queue.cancel("r"));
}

#[tokio::test(start_paused = true)]
async fn expired_claims_are_released_and_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(
        &dir,
        QueueConfig::new().claim_timeout(Duration::from_secs(60)),
    );
    queue.enqueue(record("stuck", chrono::Duration::zero())).unwrap();
    let claimed = queue.next().unwrap();

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(queue.release_expired().is_empty());
    assert!(queue.is_claimed("stuck"));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(queue.release_expired(), vec!["stuck".to_string()]);
    assert!(claimed.cancel.is_cancelled());
    assert!(!queue.is_claimed("stuck"));
    assert!(queue.release_expired().is_empty());
}

#[tokio::test(start_paused = true)]
async fn expired_holder_cannot_release_a_newer_claim() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(&dir, QueueConfig::new().claim_timeout(Duration::from_secs(1)));
    queue.enqueue(record("x", chrono::Duration::zero())).unwrap();

    let first = queue.next().unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(queue.release_expired(), vec!["x".to_string()]);

    let second = queue.next().unwrap();
    assert_ne!(first.claim, second.claim);

    let timeout = MealSyncError::Timeout(Duration::from_secs(30));
    assert!(!queue.ack("x", first.claim));
    assert!(!queue.nack("x", first.claim, &timeout));
    assert!(!queue.release("x", first.claim));

    assert!(queue.holds("x", second.claim));
    assert!(!second.cancel.is_cancelled());
    assert!(queue.next().is_none(), "x must stay single-flight");

    assert!(queue.ack("x", second.claim));
    assert!(!queue.is_claimed("x"));
}

#[tokio::test(start_paused = true)]
async fn settle_applies_only_for_the_current_in_flight_claim() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(&dir, QueueConfig::new().claim_timeout(Duration::from_secs(1)));
    queue.enqueue(record("x", chrono::Duration::zero())).unwrap();

    let stale = queue.next().unwrap();
    queue
        .store()
        .update("x", |r| r.transition(SyncState::InFlight, Utc::now()))
        .unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    queue.release_expired();
    queue
        .store()
        .update("x", |r| r.transition(SyncState::Pending, Utc::now()))
        .unwrap();

    let current = queue.next().unwrap();
    queue
        .store()
        .update("x", |r| r.transition(SyncState::InFlight, Utc::now()))
        .unwrap();
    let applied = queue
        .settle("x", stale.claim, |r| r.transition(SyncState::Synced, Utc::now()))
        .unwrap();
    assert!(!applied);
    assert_eq!(queue.store().get("x").unwrap().status(), SyncStatus::InFlight);
    assert!(queue.holds("x", current.claim));

    let applied = queue
        .settle("x", current.claim, |r| {
            r.transition(SyncState::Synced, Utc::now())
        })
        .unwrap();
    assert!(applied);
    assert_eq!(queue.store().get("x").unwrap().status(), SyncStatus::Synced);
    assert!(!queue.is_claimed("x"));
}

#[test]
fn settle_skips_records_that_left_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(&dir, QueueConfig::default());
    queue.enqueue(record("x", chrono::Duration::zero())).unwrap();

    // Claimed but never marked in flight, e.g. requeued underneath the holder.
    let claimed = queue.next().unwrap();
    let applied = queue
        .settle("x", claimed.claim, |r| r.attempts += 1)
        .unwrap();
    assert!(!applied);
    assert_eq!(queue.store().get("x").unwrap().attempts, 0);
    assert!(!queue.is_claimed("x"));
}

#[test]
fn settle_on_deleted_record_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(&dir, QueueConfig::default());
    queue.enqueue(record("x", chrono::Duration::zero())).unwrap();
    let claimed = queue.next().unwrap();
    queue.store().delete("x").unwrap();

    assert!(matches!(
        queue.settle("x", claimed.claim, |_| {}),
        Err(MealSyncError::RecordNotFound(_))
    ));
    assert!(!queue.is_claimed("x"));
}

#[test]
fn next_except_skips_listed_ids() {
    let dir = tempfile::tempdir().unwrap();
    let queue = queue(&dir, QueueConfig::default());
    queue.enqueue(record("old", chrono::Duration::minutes(5))).unwrap();
    queue.enqueue(record("new", chrono::Duration::zero())).unwrap();

    let skip = std::collections::HashSet::from(["old".to_string()]);
    assert_eq!(queue.next_except(&skip).unwrap().record.id, "new");
    assert!(queue.next_except(&skip).is_none());
}

#[tokio::test]
async fn enqueue_wakes_waiting_workers() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(queue(&dir, QueueConfig::default()));

    let waiter = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.notified().await })
    };
    // Let the waiter register before notifying.
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    queue.enqueue(record("wake", chrono::Duration::zero())).unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("worker should be woken")
        .unwrap();
}
