//! Client facade over the capture pipeline.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mealsync::{CapturePipeline, StaticToken};
//!
//! #[tokio::main]
//! async fn main() -> mealsync::Result<()> {
//!     let pipeline = CapturePipeline::builder()
//!         .data_dir("/tmp/mealsync")
//!         .endpoint("https://meals.example.com")
//!         .token_provider(Arc::new(StaticToken::new("secret")))
//!         .build()?;
//!
//!     let handle = pipeline.start();
//!     let jpeg = std::fs::read("lunch.jpg").unwrap();
//!     let record = pipeline.capture_image(jpeg, "image/jpeg")?;
//!     println!("captured {}", record.id);
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::{QueueConfig, SyncQueue};
use crate::reconcile::{ReconcileConfig, Reconciler, SweepReport};
use crate::retry::{RetryDispatcher, RetryPolicy};
use crate::store::{RecordStore, StoreConfig, default_data_dir};
use crate::transport::{AnalysisTransport, HttpTransport, TokenProvider};
use crate::types::{
    CapturePayload, CaptureRecord, NutritionItem, SyncState, SyncStatus, new_record_id,
};
use crate::uploader::{SyncEvent, Uploader, UploaderConfig};
use crate::{MealSyncError, Result};

/// Builder for [`CapturePipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    data_dir: Option<PathBuf>,
    transport: Option<Arc<dyn AnalysisTransport>>,
    endpoint: Option<String>,
    tokens: Option<Arc<dyn TokenProvider>>,
    retry: RetryPolicy,
    queue: QueueConfig,
    reconcile: ReconcileConfig,
    uploader: UploaderConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory for `captures.json` and images. Default: [`default_data_dir()`].
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Analysis server base URL (requires [`token_provider`](Self::token_provider)).
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    pub fn token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Use a custom transport instead of HTTP. Takes precedence over `endpoint`.
    pub fn transport(mut self, transport: Arc<dyn AnalysisTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    pub fn reconcile_config(mut self, config: ReconcileConfig) -> Self {
        self.reconcile = config;
        self
    }

    pub fn uploader_config(mut self, config: UploaderConfig) -> Self {
        self.uploader = config;
        self
    }

    /// Number of concurrent upload workers (1 to 4).
    pub fn workers(mut self, n: usize) -> Self {
        self.uploader = self.uploader.workers(n);
        self
    }

    /// Open the store and wire the components together.
    pub fn build(self) -> Result<CapturePipeline> {
        let transport = match (self.transport, self.endpoint, self.tokens) {
            (Some(transport), _, _) => transport,
            (None, Some(endpoint), Some(tokens)) => Arc::new(HttpTransport::new(endpoint, tokens)),
            (None, Some(_), None) => {
                return Err(MealSyncError::Configuration(
                    "an endpoint needs a token provider".into(),
                ));
            }
            (None, None, _) => {
                return Err(MealSyncError::Configuration(
                    "no analysis endpoint or transport configured".into(),
                ));
            }
        };

        let dir = self.data_dir.unwrap_or_else(default_data_dir);
        let store = Arc::new(RecordStore::open(&StoreConfig::new(dir))?);
        let queue = Arc::new(SyncQueue::new(Arc::clone(&store), self.queue));
        let uploader = Arc::new(Uploader::new(
            Arc::clone(&queue),
            transport,
            RetryDispatcher::new(self.retry),
            self.uploader,
        ));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&queue), self.reconcile));

        Ok(CapturePipeline {
            store,
            queue,
            uploader,
            reconciler,
        })
    }
}

/// Offline-first capture pipeline: store, queue, uploader, and reconciler.
pub struct CapturePipeline {
    store: Arc<RecordStore>,
    queue: Arc<SyncQueue>,
    uploader: Arc<Uploader>,
    reconciler: Arc<Reconciler>,
}

impl CapturePipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Capture a meal photo. The bytes are durable before the record is.
    pub fn capture_image(
        &self,
        bytes: impl AsRef<[u8]>,
        content_type: impl Into<String>,
    ) -> Result<CaptureRecord> {
        let bytes = bytes.as_ref();
        let content_type = content_type.into();
        if bytes.is_empty() {
            return Err(MealSyncError::InvalidInput("image is empty".into()));
        }
        let extension = extension_for(&content_type).ok_or_else(|| {
            MealSyncError::InvalidInput(format!("unsupported content type '{content_type}'"))
        })?;

        let id = new_record_id();
        let blob = self.store.write_blob(&id, extension, bytes)?;
        let record = CaptureRecord::with_id(
            id,
            CapturePayload::Image {
                blob: blob.clone(),
                content_type,
            },
        );
        if let Err(e) = self.queue.enqueue(record.clone()) {
            self.store.remove_blob(&blob);
            return Err(e);
        }
        info!(id = %record.id, bytes = bytes.len(), "captured image");
        Ok(record)
    }

    /// Capture manually entered items; the server skips image analysis.
    pub fn capture_items(&self, items: Vec<NutritionItem>) -> Result<CaptureRecord> {
        if items.is_empty() {
            return Err(MealSyncError::InvalidInput(
                "manual entry has no items".into(),
            ));
        }
        for item in &items {
            item.validate()?;
        }
        let record = CaptureRecord::new(CapturePayload::Items { items });
        self.queue.enqueue(record.clone())?;
        info!(id = %record.id, "captured manual entry");
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<CaptureRecord> {
        self.store.get(id)
    }

    pub fn list_by_state(&self, status: SyncStatus) -> Vec<CaptureRecord> {
        self.store.list_by_state(status)
    }

    /// Everything not yet synced, oldest first.
    pub fn unsynced(&self) -> Vec<CaptureRecord> {
        self.store.list_by_states(&[
            SyncStatus::Pending,
            SyncStatus::InFlight,
            SyncStatus::Failed,
        ])
    }

    /// Delete a capture and stop any future upload attempt for it.
    ///
    /// An upload already on the wire completes; its result is discarded.
    /// Returns whether the record existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let cancelled = self.queue.cancel(id);
        let removed = self.store.delete(id)?;
        debug!(id, cancelled, "deleted capture");
        Ok(removed.is_some())
    }

    /// Make a failed record eligible for upload immediately.
    pub fn retry_now(&self, id: &str) -> Result<CaptureRecord> {
        let record = self
            .store
            .get(id)
            .ok_or_else(|| MealSyncError::RecordNotFound(id.to_string()))?;
        match record.status() {
            SyncStatus::Pending => return Ok(record),
            SyncStatus::Failed => {}
            status => {
                return Err(MealSyncError::InvalidInput(format!(
                    "record {id} is {status:?}, only failed records can be retried"
                )));
            }
        }
        let record = self
            .store
            .update(id, |r| r.transition(SyncState::Pending, Utc::now()))?;
        self.queue.wake();
        info!(id, "manual retry requested");
        Ok(record)
    }

    /// Raw sync event receiver.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.uploader.subscribe()
    }

    /// Sync events as a stream. Events missed by a slow consumer are skipped.
    pub fn subscribe(&self) -> impl Stream<Item = SyncEvent> + Send + 'static {
        BroadcastStream::new(self.uploader.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "sync event consumer lagged");
                    None
                }
            }
        })
    }

    /// Upload everything eligible right now, on the calling task.
    pub async fn sync_now(&self) -> usize {
        self.uploader.drain().await
    }

    /// Run one reconciliation sweep right now.
    pub fn reconcile_now(&self) -> Result<SweepReport> {
        self.reconciler.sweep()
    }

    /// Spawn the upload workers and the reconciler.
    pub fn start(&self) -> PipelineHandle {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        self.uploader.spawn_workers(&mut tasks, &shutdown);

        let reconciler = Arc::clone(&self.reconciler);
        let token = shutdown.clone();
        tasks.spawn(async move { reconciler.run(token).await });

        PipelineHandle { shutdown, tasks }
    }
}

/// Running background tasks of a started pipeline.
pub struct PipelineHandle {
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl PipelineHandle {
    /// Token that stops the workers when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop all workers and wait for them. Passes in progress complete first.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "pipeline task ended abnormally");
            }
        }
        debug!("pipeline stopped");
    }
}

/// Blob file extension for an image content type.
fn extension_for(content_type: &str) -> Option<&'static str> {
    let extension = match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/heic" => "heic",
        "image/heif" => "heif",
        "image/gif" => "gif",
        other if other.starts_with("image/") => "img",
        _ => return None,
    };
    Some(extension)
}
