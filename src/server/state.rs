//! Shared server state: orchestrator, idempotency cache, and result sink.
//!
//! A record id is analyzed at most once. Concurrent requests for the same id
//! are coalesced by the cache; a later retry is answered from the cache or,
//! after eviction, from the sink. Failures are never cached, so a retried id
//! whose first attempt failed is analyzed again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use moka::future::Cache;
use tracing::{debug, instrument};

use super::config::ServerConfig;
use crate::orchestrator::AnalysisOrchestrator;
use crate::providers::ImageData;
use crate::telemetry;
use crate::types::{AnalysisResult, AnalyzeRequest, ErrorBody};
use crate::{MealSyncError, Result};

/// Where analysis results are stored ("save meal"), keyed by record id.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// A previously saved result for `id`, if any.
    async fn load(&self, id: &str) -> Result<Option<AnalysisResult>>;

    async fn save(&self, id: &str, result: &AnalysisResult) -> Result<()>;
}

/// In-memory sink that counts writes.
#[derive(Default)]
pub struct MemoryResultSink {
    results: Mutex<HashMap<String, AnalysisResult>>,
    saves: AtomicUsize,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored results.
    pub fn len(&self) -> usize {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total `save` calls, including overwrites.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn load(&self, id: &str) -> Result<Option<AnalysisResult>> {
        let results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        Ok(results.get(id).cloned())
    }

    async fn save(&self, id: &str, result: &AnalysisResult) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        results.insert(id.to_string(), result.clone());
        Ok(())
    }
}

/// State shared by all request handlers.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<AnalysisOrchestrator>,
    sink: Arc<dyn ResultSink>,
    results: Cache<String, AnalysisResult>,
    auth_tokens: Arc<HashSet<String>>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<AnalysisOrchestrator>,
        sink: Arc<dyn ResultSink>,
        config: &ServerConfig,
    ) -> Self {
        let results = Cache::builder()
            .max_capacity(config.idempotency.capacity)
            .time_to_live(config.idempotency.ttl())
            .build();

        Self {
            orchestrator,
            sink,
            results,
            auth_tokens: Arc::new(config.auth_tokens.iter().cloned().collect()),
        }
    }

    pub fn orchestrator(&self) -> &AnalysisOrchestrator {
        &self.orchestrator
    }

    /// Check an `Authorization` header value.
    ///
    /// Requires a non-empty bearer token; when tokens are configured it must
    /// be one of them.
    pub fn authorize(&self, header: Option<&str>) -> Result<()> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(MealSyncError::AuthenticationFailed)?;
        if !self.auth_tokens.is_empty() && !self.auth_tokens.contains(token) {
            return Err(MealSyncError::AuthenticationFailed);
        }
        Ok(())
    }

    /// Analyze a request exactly once per record id.
    #[instrument(skip(self, request), fields(id = %request.id))]
    pub async fn analyze(&self, request: AnalyzeRequest) -> Result<AnalysisResult> {
        if request.id.trim().is_empty() {
            return Err(MealSyncError::InvalidInput("request id is empty".into()));
        }
        let id = request.id.clone();

        let entry = self
            .results
            .entry(id.clone())
            .or_try_insert_with(self.load_or_compute(request))
            .await
            .map_err(unshare)?;

        if !entry.is_fresh() {
            metrics::counter!(telemetry::IDEMPOTENT_HITS_TOTAL).increment(1);
            debug!(id, "answered from idempotency cache");
        }
        Ok(entry.into_value())
    }

    async fn load_or_compute(&self, request: AnalyzeRequest) -> Result<AnalysisResult> {
        if let Some(saved) = self.sink.load(&request.id).await? {
            metrics::counter!(telemetry::IDEMPOTENT_HITS_TOTAL).increment(1);
            debug!(id = %request.id, "answered from result sink");
            return Ok(saved);
        }

        let result = match (request.decode_image()?, request.items) {
            (Some(bytes), _) => {
                let content_type = request
                    .content_type
                    .unwrap_or_else(|| "image/jpeg".to_string());
                self.orchestrator
                    .analyze(&ImageData::new(bytes, content_type))
                    .await?
            }
            (None, Some(items)) => self.orchestrator.analyze_items(items)?,
            (None, None) => {
                return Err(MealSyncError::InvalidInput(
                    "request has neither image nor items".into(),
                ));
            }
        };

        self.sink.save(&request.id, &result).await?;
        Ok(result)
    }
}

/// Recover an owned error from the cache's shared one.
fn unshare(err: Arc<MealSyncError>) -> MealSyncError {
    Arc::try_unwrap(err)
        .unwrap_or_else(|shared| ErrorBody::from_error(&shared).into_error(shared.retry_after()))
}
