//! Analysis orchestrator with fallback chain semantics.
//!
//! Providers are stored in priority order (index 0 = highest). One request
//! moves through `Received → ProviderAttempt(i) → {Success | NextProvider | AllFailed}`:
//!
//! ```text
//!   analyze(image)
//!        │ validate: non-empty, within size limit
//!        ▼
//!   ┌─────────────────────┐
//!   │ provider 0 (gemini) │ ──► timeout / 5xx / rate limit / 0 items
//!   └─────────┬───────────┘
//!             │ NextProvider
//!             ▼
//!   ┌─────────────────────┐
//!   │ provider 1 (edamam) │ ──► ≥1 item: normalize, compute totals
//!   └─────────────────────┘
//! ```
//!
//! Terminal errors (auth, invalid input, content rejected) stop the chain.
//! When the chain ends without a result the caller gets
//! [`MealSyncError::ProvidersExhausted`], classified like the last
//! provider's error.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::providers::{AnalysisProvider, ImageData};
use crate::telemetry;
use crate::types::{AnalysisResult, NutritionItem};
use crate::{MealSyncError, Result};

/// Provider name recorded on results built from manually entered items.
pub const MANUAL_PROVIDER: &str = "manual";

/// Orchestrator limits.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Largest accepted image, in bytes. Default: 10 MiB.
    pub max_image_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: 10 * 1024 * 1024,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_image_bytes(mut self, bytes: usize) -> Self {
        self.max_image_bytes = bytes;
        self
    }
}

/// Runs one analysis request across an ordered provider list.
#[derive(Default)]
pub struct AnalysisOrchestrator {
    providers: Vec<Arc<dyn AnalysisProvider>>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for AnalysisOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisOrchestrator")
            .field("providers", &self.provider_names())
            .field("config", &self.config)
            .finish()
    }
}

impl AnalysisOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            providers: Vec::new(),
            config,
        }
    }

    /// Append a provider at the lowest priority.
    pub fn add_provider(&mut self, provider: Arc<dyn AnalysisProvider>) {
        self.providers.push(provider);
    }

    /// Builder-style [`add_provider`](Self::add_provider).
    pub fn with_provider(mut self, provider: Arc<dyn AnalysisProvider>) -> Self {
        self.add_provider(provider);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Provider names in priority order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Analyze an image through the fallback chain.
    #[instrument(skip(self, image), fields(bytes = image.len(), content_type = %image.content_type))]
    pub async fn analyze(&self, image: &ImageData) -> Result<AnalysisResult> {
        self.validate(image)?;
        if self.providers.is_empty() {
            return Err(MealSyncError::NoProvider);
        }

        let mut last_err = None;
        for (i, provider) in self.providers.iter().enumerate() {
            let start = Instant::now();
            let err = match self.attempt(provider.as_ref(), image).await {
                Ok(items) => {
                    Self::record_request(provider.name(), start, true);
                    info!(
                        provider = provider.name(),
                        items = items.len(),
                        "analysis succeeded"
                    );
                    return Ok(AnalysisResult::new(
                        items,
                        provider.name(),
                        provider.version(),
                    ));
                }
                Err(e) => e,
            };
            Self::record_request(provider.name(), start, false);

            if !err.is_fallback_trigger() {
                warn!(provider = provider.name(), error = %err, "terminal provider error");
                return Err(MealSyncError::ProvidersExhausted {
                    tried: i + 1,
                    last: Box::new(err),
                });
            }

            if i + 1 < self.providers.len() {
                warn!(provider = provider.name(), error = %err, "provider failed, trying next");
                metrics::counter!(telemetry::PROVIDER_FALLBACKS_TOTAL,
                    "provider" => provider.name().to_owned(),
                    "reason" => err.code().to_owned(),
                )
                .increment(1);
            }
            last_err = Some(err);
        }

        let last = last_err.unwrap_or(MealSyncError::NoProvider);
        warn!(tried = self.providers.len(), error = %last, "all providers failed");
        Err(MealSyncError::ProvidersExhausted {
            tried: self.providers.len(),
            last: Box::new(last),
        })
    }

    /// Build a result from manually entered items without contacting providers.
    pub fn analyze_items(&self, items: Vec<NutritionItem>) -> Result<AnalysisResult> {
        if items.is_empty() {
            return Err(MealSyncError::InvalidInput(
                "manual entry has no items".into(),
            ));
        }
        for item in &items {
            item.validate()?;
        }
        debug!(items = items.len(), "accepted manual entry");
        Ok(AnalysisResult::new(
            items,
            MANUAL_PROVIDER,
            crate::version::PKG_VERSION,
        ))
    }

    fn validate(&self, image: &ImageData) -> Result<()> {
        if image.is_empty() {
            return Err(MealSyncError::InvalidInput("image is empty".into()));
        }
        if image.len() > self.config.max_image_bytes {
            return Err(MealSyncError::InvalidInput(format!(
                "image is {} bytes, limit is {}",
                image.len(),
                self.config.max_image_bytes
            )));
        }
        if !image.content_type.starts_with("image/") {
            return Err(MealSyncError::InvalidInput(format!(
                "unsupported content type '{}'",
                image.content_type
            )));
        }
        Ok(())
    }

    /// One provider call under its own deadline. Zero usable items is a soft failure.
    async fn attempt(
        &self,
        provider: &dyn AnalysisProvider,
        image: &ImageData,
    ) -> Result<Vec<NutritionItem>> {
        let deadline = provider.timeout();
        let items = match tokio::time::timeout(deadline, provider.analyze(image)).await {
            Ok(result) => result?,
            Err(_) => return Err(MealSyncError::Timeout(deadline)),
        };
        let items: Vec<_> = items
            .into_iter()
            .filter_map(NutritionItem::sanitized)
            .collect();
        if items.is_empty() {
            return Err(MealSyncError::EmptyResponse);
        }
        Ok(items)
    }

    fn record_request(provider: &str, start: Instant, ok: bool) {
        let status = if ok { "ok" } else { "error" };
        metrics::counter!(telemetry::PROVIDER_REQUESTS_TOTAL,
            "provider" => provider.to_owned(),
            "status" => status,
        )
        .increment(1);
        metrics::histogram!(telemetry::PROVIDER_DURATION_SECONDS,
            "provider" => provider.to_owned(),
        )
        .record(start.elapsed().as_secs_f64());
    }
}
