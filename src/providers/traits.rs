//! The analysis provider capability.
//!
//! Every concrete provider (Gemini vision, Edamam food database, test mocks)
//! implements [`AnalysisProvider`] and normalizes its own response schema into
//! [`NutritionItem`]s. The orchestrator never sees provider-specific shapes.
//!
//! # Fallback Semantics
//!
//! Providers report failures through [`MealSyncError`](crate::MealSyncError);
//! the orchestrator decides from the error's class whether the next provider
//! is tried:
//! - Transient and rate-limited errors advance to the next provider
//! - An empty item list advances to the next provider
//! - Terminal errors (auth, invalid input, content rejected) end the request

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;
use crate::types::NutritionItem;

/// Default per-call deadline applied by the orchestrator.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw image handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    /// MIME type, e.g. `image/jpeg`.
    pub content_type: String,
}

impl ImageData {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Provider that turns a meal photo into nutrition items.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Provider name for logging/debugging and the result's `provider` field.
    fn name(&self) -> &str;

    /// Version/tag string recorded on results (e.g. the model id).
    fn version(&self) -> &str {
        "unversioned"
    }

    /// Deadline for one `analyze` call.
    fn timeout(&self) -> Duration {
        DEFAULT_PROVIDER_TIMEOUT
    }

    /// Analyze one image. Items are returned in the provider's order;
    /// the orchestrator sanitizes them and computes totals.
    async fn analyze(&self, image: &ImageData) -> Result<Vec<NutritionItem>>;
}
