//! End-to-end client pipeline tests against a mock analysis server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mealsync::{
    CapturePipeline, FailureKind, MealSyncError, NutritionItem, RetryPolicy, StaticToken,
    SyncEvent, SyncStatus,
};

fn analyze_ok(id_calories: f64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "ignored",
        "items": [{"name": "Burrito", "calories": id_calories, "protein": 20.0}],
        "totals": {"calories": id_calories, "protein": 20.0, "carbs": 0.0, "fat": 0.0, "sugar": 0.0},
        "provider": "gemini",
        "providerVersion": "gemini-2.0-flash"
    }))
}

fn pipeline(dir: &tempfile::TempDir, server: &MockServer) -> CapturePipeline {
    CapturePipeline::builder()
        .data_dir(dir.path())
        .endpoint(server.uri())
        .token_provider(Arc::new(StaticToken::new("token")))
        .retry_policy(
            RetryPolicy::new()
                .max_attempts(2)
                .initial_delay(Duration::from_millis(10)),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn captured_image_syncs_once() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, &server);

    let record = pipeline
        .capture_image(b"\xff\xd8\xff".to_vec(), "image/jpeg")
        .unwrap();
    Mock::given(method("POST"))
        .and(path("/analyze"))
        .and(body_partial_json(json!({"id": record.id, "image": "/9j/"})))
        .respond_with(analyze_ok(700.0))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(pipeline.unsynced().len(), 1);
    assert_eq!(pipeline.sync_now().await, 1);
    assert_eq!(pipeline.sync_now().await, 0);

    let synced = pipeline.get(&record.id).unwrap();
    assert_eq!(synced.status(), SyncStatus::Synced);
    assert_eq!(synced.result.unwrap().totals().calories, 700.0);
    assert!(pipeline.unsynced().is_empty());
}

#[tokio::test]
async fn outage_keeps_record_until_manual_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(analyze_ok(300.0))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, &server);
    let record = pipeline
        .capture_items(vec![NutritionItem::new("Burrito").calories(300.0)])
        .unwrap();

    pipeline.sync_now().await;
    let failed = pipeline.get(&record.id).unwrap();
    assert_eq!(failed.status(), SyncStatus::Failed);
    assert_eq!(failed.failure().unwrap().kind, FailureKind::Exhausted);
    assert_eq!(pipeline.list_by_state(SyncStatus::Failed).len(), 1);

    // Still cooling down, so a plain sync does nothing.
    assert_eq!(pipeline.sync_now().await, 0);

    let retried = pipeline.retry_now(&record.id).unwrap();
    assert_eq!(retried.status(), SyncStatus::Pending);
    assert_eq!(pipeline.sync_now().await, 1);

    let synced = pipeline.get(&record.id).unwrap();
    assert_eq!(synced.status(), SyncStatus::Synced);
    assert_eq!(synced.attempts, 2);
    assert!(synced.last_error.is_none());
}

#[tokio::test]
async fn captures_survive_restart() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let pipeline = pipeline(&dir, &server);
        pipeline
            .capture_image(b"png".to_vec(), "image/png")
            .unwrap()
            .id
    };

    let reopened = pipeline(&dir, &server);
    let record = reopened.get(&id).unwrap();
    assert_eq!(record.status(), SyncStatus::Pending);
    assert_eq!(record.blob(), Some(format!("{id}.png").as_str()));
}

#[tokio::test]
async fn delete_removes_record_and_image() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, &server);
    let record = pipeline
        .capture_image(b"jpeg".to_vec(), "image/jpeg")
        .unwrap();
    let blob = pipeline
        .store()
        .images_dir()
        .join(record.blob().unwrap());
    assert!(blob.exists());

    assert!(pipeline.delete(&record.id).unwrap());
    assert!(pipeline.get(&record.id).is_none());
    assert!(!blob.exists());
    assert!(!pipeline.delete(&record.id).unwrap());
    assert_eq!(pipeline.sync_now().await, 0);
}

#[tokio::test]
async fn invalid_captures_are_rejected_up_front() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, &server);

    assert!(matches!(
        pipeline.capture_image(Vec::new(), "image/jpeg"),
        Err(MealSyncError::InvalidInput(_))
    ));
    assert!(matches!(
        pipeline.capture_image(b"%PDF".to_vec(), "application/pdf"),
        Err(MealSyncError::InvalidInput(_))
    ));
    assert!(matches!(
        pipeline.capture_items(Vec::new()),
        Err(MealSyncError::InvalidInput(_))
    ));
    assert!(pipeline.store().is_empty());
}

#[tokio::test]
async fn retry_now_only_applies_to_failed_records() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(analyze_ok(10.0))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, &server);

    let record = pipeline
        .capture_items(vec![NutritionItem::new("Gum").calories(10.0)])
        .unwrap();
    assert_eq!(
        pipeline.retry_now(&record.id).unwrap().status(),
        SyncStatus::Pending
    );

    pipeline.sync_now().await;
    assert!(matches!(
        pipeline.retry_now(&record.id),
        Err(MealSyncError::InvalidInput(_))
    ));
    assert!(matches!(
        pipeline.retry_now("missing"),
        Err(MealSyncError::RecordNotFound(_))
    ));
}

#[tokio::test]
async fn background_workers_sync_new_captures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(analyze_ok(420.0))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, &server);

    let events = pipeline.subscribe();
    tokio::pin!(events);
    let handle = pipeline.start();

    let record = pipeline
        .capture_items(vec![NutritionItem::new("Ramen").calories(420.0)])
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(10), events.next())
        .await
        .expect("sync event")
        .expect("stream open");
    match event {
        SyncEvent::Synced { id, result } => {
            assert_eq!(id, record.id);
            assert_eq!(result.totals().calories, 420.0);
        }
        other => panic!("unexpected event {other:?}"),
    }

    handle.shutdown().await;
    assert_eq!(
        pipeline.get(&record.id).unwrap().status(),
        SyncStatus::Synced
    );
}
