//! Edamam Food Database provider (fallback, narrower scope).
//!
//! Uses the nutrients-from-image endpoint, which recognizes a single dish
//! per photo and returns database nutrients per 100 g.
//! See: <https://developer.edamam.com/food-database-api-docs>

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::traits::{AnalysisProvider, DEFAULT_PROVIDER_TIMEOUT, ImageData};
use crate::error::{error_for_status, retry_after_header};
use crate::types::NutritionItem;
use crate::Result;

/// Default base URL for the Edamam API
const DEFAULT_BASE_URL: &str = "https://api.edamam.com";

const ENDPOINT: &str = "/api/food-database/v2/nutrients-from-image";

/// Client for the Edamam Food Database API.
#[derive(Clone)]
pub struct EdamamProvider {
    app_id: String,
    app_key: String,
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl EdamamProvider {
    pub fn new(app_id: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self::with_base_url(app_id, app_key, DEFAULT_BASE_URL)
    }

    /// Create a provider with a custom base URL (for testing with wiremock).
    pub fn with_base_url(
        app_id: impl Into<String>,
        app_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let http = Client::builder()
            .user_agent(crate::version::user_agent())
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");

        Self {
            app_id: app_id.into(),
            app_key: app_key.into(),
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AnalysisProvider for EdamamProvider {
    fn name(&self) -> &str {
        "edamam"
    }

    fn version(&self) -> &str {
        "food-database-v2"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn analyze(&self, image: &ImageData) -> Result<Vec<NutritionItem>> {
        let url = format!("{}{}", self.base_url, ENDPOINT);
        let data_uri = format!(
            "data:{};base64,{}",
            image.content_type,
            BASE64.encode(&image.bytes)
        );

        let response = self
            .http
            .post(&url)
            .query(&[("app_id", &self.app_id), ("app_key", &self.app_key)])
            .json(&ImageRequest { image: &data_uri })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            return Err(error_for_status(
                status,
                retry_after,
                format!("Edamam API error: {status}"),
            ));
        }

        let body: ParserResponse = response.json().await?;
        Ok(body.parsed.into_iter().filter_map(Parsed::into_item).collect())
    }
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    image: &'a str,
}

#[derive(Deserialize)]
struct ParserResponse {
    #[serde(default)]
    parsed: Vec<Parsed>,
}

#[derive(Deserialize)]
struct Parsed {
    food: Food,
    quantity: Option<f64>,
    measure: Option<Measure>,
}

#[derive(Deserialize)]
struct Food {
    label: String,
    #[serde(default)]
    nutrients: Nutrients,
}

/// Edamam nutrient codes.
#[derive(Deserialize, Default)]
struct Nutrients {
    #[serde(rename = "ENERC_KCAL")]
    energy_kcal: Option<f64>,
    #[serde(rename = "PROCNT")]
    protein: Option<f64>,
    #[serde(rename = "CHOCDF")]
    carbs: Option<f64>,
    #[serde(rename = "FAT")]
    fat: Option<f64>,
    #[serde(rename = "SUGAR")]
    sugar: Option<f64>,
}

#[derive(Deserialize)]
struct Measure {
    label: Option<String>,
}

impl Parsed {
    fn into_item(self) -> Option<NutritionItem> {
        let n = self.food.nutrients;
        let mut item = NutritionItem::new(self.food.label);
        item.calories = n.energy_kcal;
        item.protein = n.protein;
        item.carbs = n.carbs;
        item.fat = n.fat;
        item.sugar = n.sugar;
        item.portion = match (self.quantity, self.measure.and_then(|m| m.label)) {
            (Some(q), Some(label)) => Some(format!("{q} {label}")),
            (None, Some(label)) => Some(label),
            _ => Some("100 g".to_string()),
        };
        item.sanitized()
    }
}
