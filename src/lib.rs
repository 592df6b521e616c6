//! Mealsync - durable offline meal capture with fallback-aware analysis
//!
//! The client side keeps every capture in a crash-safe local store and
//! uploads it through a single-flight queue with exponential backoff. The
//! server side analyzes each photo through an ordered chain of nutrition
//! providers, falling back on timeouts, upstream errors, and empty results.
//!
//! ```text
//! capture ─► RecordStore (pending) ─► SyncQueue ─► Uploader ─► RetryDispatcher
//!                                                                │ POST /analyze
//!                                                                ▼
//!                                     AnalysisOrchestrator ─► provider 0, 1, ...
//! ```
//!
//! # Client Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mealsync::{CapturePipeline, NutritionItem, StaticToken};
//!
//! #[tokio::main]
//! async fn main() -> mealsync::Result<()> {
//!     let pipeline = CapturePipeline::builder()
//!         .endpoint("https://meals.example.com")
//!         .token_provider(Arc::new(StaticToken::new("secret")))
//!         .build()?;
//!
//!     pipeline.capture_items(vec![NutritionItem::new("Apple").calories(95.0)])?;
//!     let uploaded = pipeline.sync_now().await;
//!     println!("uploaded {uploaded} record(s)");
//!     Ok(())
//! }
//! ```
//!
//! # Orchestrator Example (requires `gemini` and `edamam` features)
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mealsync::orchestrator::{AnalysisOrchestrator, OrchestratorConfig};
//! use mealsync::providers::{EdamamProvider, GeminiProvider, ImageData};
//!
//! let orchestrator = AnalysisOrchestrator::new(OrchestratorConfig::default())
//!     .with_provider(Arc::new(GeminiProvider::new("gemini-key")))
//!     .with_provider(Arc::new(EdamamProvider::new("app-id", "app-key")));
//!
//! let result = orchestrator.analyze(&ImageData::new(jpeg, "image/jpeg")).await?;
//! println!("{} kcal", result.totals().calories);
//! ```

pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod providers;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod uploader;
pub mod version;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

// Re-export main types at crate root
pub use error::{ErrorClass, MealSyncError, Result};
pub use orchestrator::{AnalysisOrchestrator, OrchestratorConfig};
pub use pipeline::{CapturePipeline, PipelineBuilder, PipelineHandle};
pub use providers::{AnalysisProvider, ImageData};
pub use queue::{ClaimId, ClaimedRecord, QueueConfig, SyncQueue};
pub use reconcile::{ReconcileConfig, Reconciler, SweepReport};
pub use retry::{RetryDispatcher, RetryError, RetryPolicy};
pub use store::{RecordStore, StoreConfig};
pub use transport::{AnalysisTransport, HttpTransport, StaticToken, TokenProvider};
pub use types::{
    AnalysisResult, AnalyzeRequest, AnalyzeResponse, CapturePayload, CaptureRecord, ErrorBody,
    FailureInfo, FailureKind, NutritionItem, RecordId, SyncState, SyncStatus, Totals,
};
pub use uploader::{SyncEvent, UploadOutcome, Uploader, UploaderConfig};
pub use version::{PKG_VERSION, version_string};
