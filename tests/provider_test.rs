//! Wire-level tests for the Gemini and Edamam providers.

#![cfg(all(feature = "gemini", feature = "edamam"))]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mealsync::providers::{EdamamProvider, GeminiProvider};
use mealsync::{AnalysisOrchestrator, AnalysisProvider, ErrorClass, ImageData, MealSyncError};

fn jpeg() -> ImageData {
    // base64: /9j/
    ImageData::new(vec![0xff, 0xd8, 0xff], "image/jpeg")
}

fn gemini_text(text: &str) -> serde_json::Value {
    json!({
        "candidates": [{
            "content": {"parts": [{"text": text}], "role": "model"},
            "finishReason": "STOP"
        }]
    })
}

// ============================================================================
// Gemini
// ============================================================================

#[tokio::test]
async fn gemini_parses_items_from_model_text() {
    let server = MockServer::start().await;
    let answer = r#"```json
[{"name": "Grilled salmon", "portion": "150 g", "calories": 280, "protein": "31 g", "carbs": 0, "fat": 17, "sugar": null, "confidence": 0.9},
 {"name": "Rice", "calories": 205}]
```"#;

    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash:generateContent"))
        .and(header("x-goog-api-key", "test-key"))
        .and(body_partial_json(json!({
            "generationConfig": {"responseMimeType": "application/json"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text(answer)))
        .expect(1)
        .mount(&server)
        .await;

    let provider = GeminiProvider::with_base_url("test-key", server.uri());
    let items = provider.analyze(&jpeg()).await.unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].name, "Grilled salmon");
    assert_eq!(items[0].protein, Some(31.0));
    assert_eq!(items[0].sugar, None);
    assert_eq!(items[0].portion.as_deref(), Some("150 g"));
    assert_eq!(items[1].calories, Some(205.0));
    assert_eq!(items[1].fat, None);
}

#[tokio::test]
async fn gemini_custom_model_is_used_in_path_and_version() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-1.5-pro:generateContent"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(gemini_text(r#"[{"name": "apple"}]"#)),
        )
        .mount(&server)
        .await;

    let provider = GeminiProvider::with_base_url("k", server.uri()).model("gemini-1.5-pro");
    assert_eq!(provider.version(), "gemini-1.5-pro");
    assert_eq!(provider.analyze(&jpeg()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn gemini_rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "11")
                .set_body_json(json!({"error": {"code": 429, "message": "quota exceeded"}})),
        )
        .mount(&server)
        .await;

    let provider = GeminiProvider::with_base_url("k", server.uri());
    let err = provider.analyze(&jpeg()).await.unwrap_err();
    assert_eq!(
        err.class(),
        ErrorClass::RateLimited {
            retry_after: Some(Duration::from_secs(11))
        }
    );
}

#[tokio::test]
async fn gemini_server_error_is_transient_with_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(503)
                .set_body_json(json!({"error": {"code": 503, "message": "model overloaded"}})),
        )
        .mount(&server)
        .await;

    let err = GeminiProvider::with_base_url("k", server.uri())
        .analyze(&jpeg())
        .await
        .unwrap_err();
    assert!(err.is_fallback_trigger());
    assert!(err.to_string().contains("model overloaded"));
}

#[tokio::test]
async fn gemini_bad_key_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_json(
            json!({"error": {"code": 403, "message": "API key not valid"}}),
        ))
        .mount(&server)
        .await;

    let err = GeminiProvider::with_base_url("bad", server.uri())
        .analyze(&jpeg())
        .await
        .unwrap_err();
    assert!(matches!(err, MealSyncError::AuthenticationFailed));
}

#[tokio::test]
async fn gemini_safety_block_is_content_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"finishReason": "SAFETY"}]
        })))
        .mount(&server)
        .await;

    let err = GeminiProvider::with_base_url("k", server.uri())
        .analyze(&jpeg())
        .await
        .unwrap_err();
    assert!(matches!(err, MealSyncError::ContentRejected { .. }));
    assert_eq!(err.class(), ErrorClass::Terminal);
}

#[tokio::test]
async fn gemini_blocked_prompt_is_content_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "promptFeedback": {"blockReason": "OTHER"}
        })))
        .mount(&server)
        .await;

    let err = GeminiProvider::with_base_url("k", server.uri())
        .analyze(&jpeg())
        .await
        .unwrap_err();
    assert!(matches!(err, MealSyncError::ContentRejected { .. }));
}

#[tokio::test]
async fn gemini_prose_answer_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(gemini_text("I see a delicious plate of pasta!")),
        )
        .mount(&server)
        .await;

    let err = GeminiProvider::with_base_url("k", server.uri())
        .analyze(&jpeg())
        .await
        .unwrap_err();
    assert!(matches!(err, MealSyncError::MalformedResponse(_)));
    assert!(err.is_fallback_trigger());
}

// ============================================================================
// Edamam
// ============================================================================

fn edamam_body() -> serde_json::Value {
    json!({
        "text": "",
        "parsed": [{
            "food": {
                "foodId": "food_a1",
                "label": "Margherita Pizza",
                "nutrients": {"ENERC_KCAL": 266.0, "PROCNT": 11.0, "CHOCDF": 33.0, "FAT": 10.0}
            },
            "quantity": 2.0,
            "measure": {"uri": "x", "label": "Slice"}
        }],
        "hints": []
    })
}

#[tokio::test]
async fn edamam_parses_recognized_food() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/food-database/v2/nutrients-from-image"))
        .and(query_param("app_id", "my-app"))
        .and(query_param("app_key", "my-key"))
        .and(body_partial_json(json!({"image": "data:image/jpeg;base64,/9j/"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(edamam_body()))
        .expect(1)
        .mount(&server)
        .await;

    let provider = EdamamProvider::with_base_url("my-app", "my-key", server.uri());
    let items = provider.analyze(&jpeg()).await.unwrap();

    assert_eq!(items.len(), 1);
    let pizza = &items[0];
    assert_eq!(pizza.name, "Margherita Pizza");
    assert_eq!(pizza.calories, Some(266.0));
    assert_eq!(pizza.carbs, Some(33.0));
    assert_eq!(pizza.sugar, None);
    assert_eq!(pizza.portion.as_deref(), Some("2 Slice"));
}

#[tokio::test]
async fn edamam_unrecognized_image_yields_no_items() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"parsed": [], "hints": []})))
        .mount(&server)
        .await;

    let items = EdamamProvider::with_base_url("a", "b", server.uri())
        .analyze(&jpeg())
        .await
        .unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn edamam_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = EdamamProvider::with_base_url("a", "b", server.uri())
        .analyze(&jpeg())
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);
}

// ============================================================================
// Both providers behind the orchestrator
// ============================================================================

#[tokio::test]
async fn gemini_outage_falls_back_to_edamam() {
    let gemini = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&gemini)
        .await;

    let edamam = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(edamam_body()))
        .expect(1)
        .mount(&edamam)
        .await;

    let orchestrator = AnalysisOrchestrator::default()
        .with_provider(Arc::new(GeminiProvider::with_base_url("k", gemini.uri())))
        .with_provider(Arc::new(EdamamProvider::with_base_url(
            "a",
            "b",
            edamam.uri(),
        )));

    let result = orchestrator.analyze(&jpeg()).await.unwrap();
    assert_eq!(result.provider(), "edamam");
    assert_eq!(result.version(), "food-database-v2");
    assert_eq!(result.totals().calories, 266.0);
}

#[tokio::test]
async fn slow_gemini_times_out_into_edamam() {
    let gemini = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(gemini_text(r#"[{"name": "late"}]"#))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&gemini)
        .await;

    let edamam = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(edamam_body()))
        .mount(&edamam)
        .await;

    let orchestrator = AnalysisOrchestrator::default()
        .with_provider(Arc::new(
            GeminiProvider::with_base_url("k", gemini.uri())
                .with_timeout(Duration::from_millis(200)),
        ))
        .with_provider(Arc::new(EdamamProvider::with_base_url(
            "a",
            "b",
            edamam.uri(),
        )));

    let result = orchestrator.analyze(&jpeg()).await.unwrap();
    assert_eq!(result.provider(), "edamam");
}
