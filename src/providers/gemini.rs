//! Google Gemini vision provider (primary, high fidelity).
//!
//! Sends the photo inline to `generateContent` with a prompt asking for a
//! JSON array of food items, then parses the model's text leniently: code
//! fences are stripped and numbers may arrive as strings.
//! See: <https://ai.google.dev/api/generate-content>

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::traits::{AnalysisProvider, DEFAULT_PROVIDER_TIMEOUT, ImageData};
use crate::error::{error_for_status, retry_after_header};
use crate::types::NutritionItem;
use crate::{MealSyncError, Result};

/// Default base URL for the Gemini API
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default vision model
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const PROMPT: &str = "Identify every food or drink visible in this meal photo. \
Respond with only a JSON array. Each element must be an object with the keys \
\"name\" (string), \"portion\" (string, e.g. \"1 cup\"), \"calories\" (kcal), \
\"protein\", \"carbs\", \"fat\" and \"sugar\" (grams), and \"confidence\" (0 to 1). \
Use null for any value you cannot estimate. Respond with [] if there is no food.";

/// Client for Gemini `generateContent`.
#[derive(Clone)]
pub struct GeminiProvider {
    api_key: String,
    model: String,
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl GeminiProvider {
    /// Create a provider with the given API key and the default model.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Create a provider with a custom base URL (for testing with wiremock).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        // The orchestrator enforces the per-call deadline; this is a backstop.
        let http = Client::builder()
            .user_agent(crate::version::user_agent())
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");

        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn generate(&self, image: &ImageData) -> Result<GenerateResponse> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text { text: PROMPT },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: &image.content_type,
                            data: BASE64.encode(&image.bytes),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                temperature: 0.1,
            },
        };

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| format!("Gemini API error: {status}"));
            return Err(error_for_status(status, retry_after, message));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl AnalysisProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn version(&self) -> &str {
        &self.model
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn analyze(&self, image: &ImageData) -> Result<Vec<NutritionItem>> {
        let response = self.generate(image).await?;

        if let Some(reason) = response
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
        {
            return Err(MealSyncError::ContentRejected {
                reason: format!("prompt blocked: {reason}"),
            });
        }

        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or(MealSyncError::EmptyResponse)?;

        if let Some(reason) = candidate.finish_reason.as_deref()
            && matches!(reason, "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST")
        {
            return Err(MealSyncError::ContentRejected {
                reason: format!("response blocked: {reason}"),
            });
        }

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        debug!(chars = text.len(), "gemini response text");
        parse_items(&text)
    }
}

/// Parse the model's JSON answer into items.
///
/// Accepts a bare array or an object wrapping it under `items`/`foods`.
pub(crate) fn parse_items(text: &str) -> Result<Vec<NutritionItem>> {
    let json = strip_code_fence(text);
    if json.is_empty() {
        return Err(MealSyncError::EmptyResponse);
    }
    let value: Value = serde_json::from_str(json)
        .map_err(|e| MealSyncError::MalformedResponse(format!("gemini: {e}")))?;

    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("items").or_else(|| map.remove("foods")) {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(MealSyncError::MalformedResponse(
                    "gemini: expected a JSON array of items".into(),
                ));
            }
        },
        _ => {
            return Err(MealSyncError::MalformedResponse(
                "gemini: expected a JSON array of items".into(),
            ));
        }
    };

    Ok(entries.iter().filter_map(item_from_value).collect())
}

fn item_from_value(value: &Value) -> Option<NutritionItem> {
    let name = value
        .get("name")
        .or_else(|| value.get("food"))
        .and_then(Value::as_str)?;

    let mut item = NutritionItem::new(name);
    item.calories = number(value, &["calories", "kcal"]);
    item.protein = number(value, &["protein", "protein_g"]);
    item.carbs = number(value, &["carbs", "carbohydrates", "carbs_g"]);
    item.fat = number(value, &["fat", "fat_g"]);
    item.sugar = number(value, &["sugar", "sugars", "sugar_g"]);
    item.portion = value
        .get("portion")
        .or_else(|| value.get("serving"))
        .and_then(Value::as_str)
        .map(str::to_string);
    item.confidence = number(value, &["confidence"]).map(|c| c as f32);
    item.sanitized()
}

/// First key present as a number (or a numeric string such as `"12 g"`).
fn number(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match value.get(*key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_end_matches(|c: char| c.is_alphabetic() || c.is_whitespace())
            .parse()
            .ok(),
        _ => None,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening fence line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().trim_end_matches("```").trim()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text {
        text: &'a str,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData<'a>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    temperature: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_array() {
        let text = "```json\n[{\"name\": \"Rice\", \"calories\": 200, \"protein\": \"4 g\"}]\n```";
        let items = parse_items(text).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Rice");
        assert_eq!(items[0].calories, Some(200.0));
        assert_eq!(items[0].protein, Some(4.0));
        assert_eq!(items[0].fat, None);
    }

    #[test]
    fn parses_wrapped_object() {
        let items = parse_items(r#"{"items": [{"name": "Egg", "fat": 5.3}]}"#).unwrap();
        assert_eq!(items[0].fat, Some(5.3));
    }

    #[test]
    fn empty_array_parses_to_no_items() {
        assert!(parse_items("[]").unwrap().is_empty());
    }

    #[test]
    fn negative_values_become_unknown() {
        let items = parse_items(r#"[{"name": "Soup", "calories": -10}]"#).unwrap();
        assert_eq!(items[0].calories, None);
    }

    #[test]
    fn nameless_entries_are_skipped() {
        let items = parse_items(r#"[{"calories": 10}, {"name": "  "}, {"name": "Tea"}]"#).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Tea");
    }

    #[test]
    fn prose_is_malformed() {
        let err = parse_items("I see a sandwich.").unwrap_err();
        assert!(matches!(err, MealSyncError::MalformedResponse(_)));
    }

    #[test]
    fn blank_text_is_empty_response() {
        assert!(matches!(
            parse_items("  ").unwrap_err(),
            MealSyncError::EmptyResponse
        ));
    }
}
