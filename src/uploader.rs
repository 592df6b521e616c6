//! Upload workers.
//!
//! Each pass claims one record from the [`SyncQueue`], marks it `InFlight`,
//! and posts it through the [`RetryDispatcher`]. The outcome is written back
//! to the [`RecordStore`] before the claim is released, so a record is never
//! dropped: it ends a pass as `Synced` or `Failed` (or is gone because the
//! user deleted it).
//!
//! Uploads are idempotent by record id on the server, so a crash between
//! send and ack only causes a deduplicated resend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::queue::{ClaimId, ClaimedRecord, SyncQueue};
use crate::retry::{RetryDispatcher, RetryError};
use crate::store::RecordStore;
use crate::telemetry;
use crate::transport::AnalysisTransport;
use crate::types::{
    AnalysisResult, AnalyzeRequest, CapturePayload, CaptureRecord, FailureInfo, RecordId,
    SyncState,
};
use crate::{MealSyncError, Result};

/// Capacity of the sync event channel.
const EVENT_BUFFER: usize = 256;

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Concurrent workers, clamped to `1..=4`. Default: 2.
    pub workers: usize,
    /// How long an idle worker sleeps before polling again. Default: 5s.
    pub idle_wait: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            idle_wait: Duration::from_secs(5),
        }
    }
}

impl UploaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.clamp(1, 4);
        self
    }

    pub fn idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }
}

/// Emitted after each upload pass, for UI refresh.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Synced {
        id: RecordId,
        result: AnalysisResult,
    },
    Failed {
        id: RecordId,
        failure: FailureInfo,
    },
}

/// What one upload pass did.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Synced(RecordId),
    Failed(RecordId),
    /// The record was deleted, or the claim was lost to a newer pass, while
    /// this pass ran; any result was dropped.
    Discarded(RecordId),
}

/// Drains the sync queue into the analysis server.
pub struct Uploader {
    store: Arc<RecordStore>,
    queue: Arc<SyncQueue>,
    transport: Arc<dyn AnalysisTransport>,
    dispatcher: RetryDispatcher,
    events: broadcast::Sender<SyncEvent>,
    config: UploaderConfig,
}

impl Uploader {
    pub fn new(
        queue: Arc<SyncQueue>,
        transport: Arc<dyn AnalysisTransport>,
        dispatcher: RetryDispatcher,
        config: UploaderConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store: Arc::clone(queue.store()),
            queue,
            transport,
            dispatcher,
            events,
            config,
        }
    }

    /// Subscribe to sync events. Lagging receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Claim and upload one record. Returns `None` when nothing is eligible.
    pub async fn process_next(&self) -> Option<UploadOutcome> {
        let claimed = self.queue.next()?;
        Some(self.process(claimed).await)
    }

    /// Run passes until the queue has nothing eligible, at most one per
    /// record. Returns the pass count.
    pub async fn drain(&self) -> usize {
        let mut done = HashSet::new();
        while let Some(claimed) = self.queue.next_except(&done) {
            done.insert(claimed.record.id.clone());
            self.process(claimed).await;
        }
        done.len()
    }

    /// Worker loop: upload until `shutdown` fires.
    ///
    /// Shutdown is observed between passes; a pass in progress completes.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if self.process_next().await.is_some() {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(self.config.idle_wait) => {}
            }
        }
        debug!("upload worker stopped");
    }

    /// Spawn the configured number of workers onto `tasks`.
    pub fn spawn_workers(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) {
        let workers = self.config.workers.clamp(1, 4);
        info!(workers, transport = self.transport.name(), "starting upload workers");
        for _ in 0..workers {
            let uploader = Arc::clone(self);
            let shutdown = shutdown.clone();
            tasks.spawn(async move { uploader.run(shutdown).await });
        }
    }

    #[instrument(skip_all, fields(id = %claimed.record.id))]
    async fn process(&self, claimed: ClaimedRecord) -> UploadOutcome {
        let ClaimedRecord {
            record,
            claim,
            cancel,
        } = claimed;
        let id = record.id.clone();

        let marked = self
            .store
            .update(&id, |r| r.transition(SyncState::InFlight, Utc::now()));
        if let Err(e) = marked {
            return self.abandon(&id, claim, e);
        }

        let outcome = match self.build_request(&record).await {
            Ok(request) => self
                .dispatcher
                .execute_cancellable(
                    "upload",
                    &cancel,
                    || self.transport.submit(&request),
                    MealSyncError::class,
                )
                .await
                .map_err(|e| match e {
                    RetryError::Cancelled { .. } => None,
                    other => Some(MealSyncError::from(other)),
                }),
            Err(e) => Err(Some(e)),
        };

        match outcome {
            Ok(response) => self.complete(&id, claim, response.into_result()),
            Err(Some(error)) => self.fail(&id, claim, error),
            Err(None) => {
                // Deleted (or the claim was revoked) between attempts.
                self.queue.release(&id, claim);
                metrics::counter!(telemetry::UPLOADS_TOTAL, "status" => "discarded").increment(1);
                debug!("upload cancelled");
                UploadOutcome::Discarded(id)
            }
        }
    }

    async fn build_request(&self, record: &CaptureRecord) -> Result<AnalyzeRequest> {
        match &record.payload {
            CapturePayload::Image { blob, content_type } => {
                let bytes = self.store.read_blob(blob).await?;
                Ok(AnalyzeRequest::image(&record.id, &bytes, content_type))
            }
            CapturePayload::Items { items } => {
                Ok(AnalyzeRequest::items(&record.id, items.clone()))
            }
        }
    }

    fn complete(&self, id: &str, claim: ClaimId, result: AnalysisResult) -> UploadOutcome {
        let now = Utc::now();
        let stored = self.queue.settle(id, claim, |r| {
            r.transition(SyncState::Synced, now);
            r.attempts += 1;
            r.last_error = None;
            r.synced_at = Some(now);
            r.result = Some(result.clone());
        });
        match stored {
            Ok(true) => {}
            Ok(false) => return self.superseded(id),
            Err(e) => return self.abandon(id, claim, e),
        }
        metrics::counter!(telemetry::UPLOADS_TOTAL, "status" => "ok").increment(1);
        info!(items = result.items().len(), provider = result.provider(), "record synced");
        let _ = self.events.send(SyncEvent::Synced {
            id: id.to_string(),
            result,
        });
        UploadOutcome::Synced(id.to_string())
    }

    fn fail(&self, id: &str, claim: ClaimId, error: MealSyncError) -> UploadOutcome {
        let failure = FailureInfo::from_error(&error, Utc::now());
        let stored = self.queue.settle(id, claim, |r| {
            r.transition(
                SyncState::Failed {
                    reason: failure.clone(),
                },
                failure.at,
            );
            r.attempts += 1;
            r.last_error = Some(failure.clone());
        });
        match stored {
            Ok(true) => {}
            Ok(false) => return self.superseded(id),
            Err(e) => return self.abandon(id, claim, e),
        }
        metrics::counter!(telemetry::UPLOADS_TOTAL, "status" => "error").increment(1);
        warn!(error = %error, kind = ?failure.kind, "upload failed, record kept for retry");
        let _ = self.events.send(SyncEvent::Failed {
            id: id.to_string(),
            failure,
        });
        UploadOutcome::Failed(id.to_string())
    }

    /// The claim expired and the record moved on without this pass.
    fn superseded(&self, id: &str) -> UploadOutcome {
        metrics::counter!(telemetry::UPLOADS_TOTAL, "status" => "discarded").increment(1);
        warn!(id, "claim lost before the outcome was stored, dropping it");
        UploadOutcome::Discarded(id.to_string())
    }

    /// The record could not be written back. A missing record was deleted
    /// by the user; any other store error leaves the record for reconciliation.
    fn abandon(&self, id: &str, claim: ClaimId, error: MealSyncError) -> UploadOutcome {
        self.queue.release(id, claim);
        metrics::counter!(telemetry::UPLOADS_TOTAL, "status" => "discarded").increment(1);
        match error {
            MealSyncError::RecordNotFound(_) => {
                debug!(id, "record deleted during upload, discarding result");
            }
            other => {
                warn!(id, error = %other, "failed to persist upload outcome");
            }
        }
        UploadOutcome::Discarded(id.to_string())
    }
}
