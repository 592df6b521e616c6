//! Request and response bodies for `POST /analyze`.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::nutrition::{AnalysisResult, NutritionItem, Totals};
use crate::{MealSyncError, Result};

/// Upload body. Exactly one of `image` or `items` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    /// Record id; the server dedupes on it.
    pub id: String,
    /// Base64-encoded image bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<NutritionItem>>,
}

impl AnalyzeRequest {
    pub fn image(id: impl Into<String>, bytes: &[u8], content_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: Some(STANDARD.encode(bytes)),
            content_type: Some(content_type.into()),
            items: None,
        }
    }

    pub fn items(id: impl Into<String>, items: Vec<NutritionItem>) -> Self {
        Self {
            id: id.into(),
            image: None,
            content_type: None,
            items: Some(items),
        }
    }

    /// Decode the image payload, if present.
    pub fn decode_image(&self) -> Result<Option<Vec<u8>>> {
        self.image
            .as_deref()
            .map(|data| {
                STANDARD
                    .decode(data.trim())
                    .map_err(|e| MealSyncError::InvalidInput(format!("image is not valid base64: {e}")))
            })
            .transpose()
    }
}

/// Successful analysis body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub id: String,
    pub items: Vec<NutritionItem>,
    pub totals: Totals,
    pub provider: String,
    pub provider_version: String,
}

impl AnalyzeResponse {
    pub fn new(id: impl Into<String>, result: &AnalysisResult) -> Self {
        Self {
            id: id.into(),
            items: result.items().to_vec(),
            totals: *result.totals(),
            provider: result.provider().to_string(),
            provider_version: result.version().to_string(),
        }
    }

    /// Rebuild the canonical result. Totals are recomputed from the items.
    pub fn into_result(self) -> AnalysisResult {
        AnalysisResult::new(self.items, self.provider, self.provider_version)
    }
}

/// Structured error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorBody {
    pub fn from_error(err: &MealSyncError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_transient(),
            retry_after_secs: err.retry_after().map(|d| d.as_secs()),
        }
    }

    /// Reconstruct a classified error on the client side.
    ///
    /// `header_retry_after` fills in the hint when the body has none.
    pub fn into_error(self, header_retry_after: Option<Duration>) -> MealSyncError {
        let retry_after = self
            .retry_after_secs
            .map(Duration::from_secs)
            .or(header_retry_after);
        match self.code.as_str() {
            "unauthorized" => MealSyncError::AuthenticationFailed,
            "rate_limited" => MealSyncError::RateLimited { retry_after },
            "invalid_input" => MealSyncError::InvalidInput(self.message),
            "content_rejected" => MealSyncError::ContentRejected {
                reason: self.message,
            },
            _ => MealSyncError::Remote {
                code: self.code,
                message: self.message,
                retryable: self.retryable,
                retry_after,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorClass;

    #[test]
    fn image_request_round_trips_bytes() {
        let req = AnalyzeRequest::image("r1", &[0xff, 0xd8, 0x00, 0x42], "image/jpeg");
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("items").is_none());
        let back: AnalyzeRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.decode_image().unwrap(), Some(vec![0xff, 0xd8, 0x00, 0x42]));
    }

    #[test]
    fn bad_base64_is_invalid_input() {
        let req = AnalyzeRequest {
            id: "r1".into(),
            image: Some("***".into()),
            content_type: None,
            items: None,
        };
        assert!(matches!(
            req.decode_image(),
            Err(MealSyncError::InvalidInput(_))
        ));
    }

    #[test]
    fn response_recomputes_totals() {
        let json = serde_json::json!({
            "id": "r1",
            "items": [{"name": "apple", "calories": 52.0}],
            "totals": {"calories": 9999.0, "protein": 0.0, "carbs": 0.0, "fat": 0.0, "sugar": 0.0},
            "provider": "gemini",
            "providerVersion": "gemini-2.0-flash"
        });
        let resp: AnalyzeResponse = serde_json::from_value(json).unwrap();
        let result = resp.into_result();
        assert_eq!(result.totals().calories, 52.0);
        assert_eq!(result.version(), "gemini-2.0-flash");
    }

    #[test]
    fn error_body_preserves_classification() {
        let body = ErrorBody::from_error(&MealSyncError::RateLimited {
            retry_after: Some(Duration::from_secs(4)),
        });
        assert!(body.retryable);
        let err = body.into_error(None);
        assert_eq!(
            err.class(),
            ErrorClass::RateLimited {
                retry_after: Some(Duration::from_secs(4))
            }
        );

        let exhausted = ErrorBody::from_error(&MealSyncError::ProvidersExhausted {
            tried: 2,
            last: Box::new(MealSyncError::AuthenticationFailed),
        });
        assert_eq!(exhausted.code, "providers_exhausted");
        assert!(!exhausted.retryable);
        assert_eq!(exhausted.into_error(None).class(), ErrorClass::Terminal);
    }
}
