//! Reconciliation sweep.
//!
//! Periodically moves stuck work back to `Pending` and prunes records that
//! have been synced for longer than the retention window. `Pending` and
//! `Failed` records are never deleted, whatever their age.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::SyncQueue;
use crate::store::RecordStore;
use crate::telemetry;
use crate::types::{CaptureRecord, SyncState};
use crate::Result;

/// Sweep schedule and retention.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Time between sweeps. Default: 3 min.
    pub interval: Duration,
    /// How long synced records are kept. Default: 30 days.
    pub retention: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(180),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl ReconcileConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention_days(self, days: u64) -> Self {
        self.retention(Duration::from_secs(days * 24 * 60 * 60))
    }
}

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Ids moved back to `Pending`.
    pub requeued: Vec<String>,
    /// Ids of synced records deleted by retention.
    pub pruned: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.pruned.is_empty()
    }
}

/// Background sweeper over the store and queue.
pub struct Reconciler {
    store: Arc<RecordStore>,
    queue: Arc<SyncQueue>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(queue: Arc<SyncQueue>, config: ReconcileConfig) -> Self {
        Self {
            store: Arc::clone(queue.store()),
            queue,
            config,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run one sweep now.
    ///
    /// Requeues:
    /// - `InFlight` records whose claim timed out
    /// - `InFlight` records nobody holds a claim on that have been in flight
    ///   longer than the claim timeout (left behind by a previous process)
    /// - `Failed` records, unless the payload itself was rejected
    pub fn sweep(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let revoked: HashSet<String> = self.queue.release_expired().into_iter().collect();
        let claimed: HashSet<String> = self.queue.claimed_ids().into_iter().collect();
        let stale_before = cutoff(now, self.queue.config().claim_timeout);

        let requeued = self.store.update_where(
            |r| {
                !claimed.contains(&r.id)
                    && match &r.sync_state {
                        SyncState::InFlight => {
                            revoked.contains(&r.id)
                                || r.state_changed_at.is_none_or(|t| t <= stale_before)
                        }
                        SyncState::Failed { reason } => !reason.kind.is_permanent(),
                        _ => false,
                    }
            },
            |r| r.transition(SyncState::Pending, now),
        )?;

        let retain_after = cutoff(now, self.config.retention);
        let pruned: Vec<String> = self
            .store
            .remove_where(|r| is_expired(r, retain_after))?
            .into_iter()
            .map(|r| r.id)
            .collect();

        if !requeued.is_empty() {
            metrics::counter!(telemetry::RECONCILE_REQUEUED_TOTAL)
                .increment(requeued.len() as u64);
            self.queue.wake();
        }
        if !pruned.is_empty() {
            metrics::counter!(telemetry::RECONCILE_PRUNED_TOTAL).increment(pruned.len() as u64);
        }

        let report = SweepReport { requeued, pruned };
        if report.is_empty() {
            debug!("reconciliation sweep: nothing to do");
        } else {
            info!(
                requeued = report.requeued.len(),
                pruned = report.pruned.len(),
                "reconciliation sweep"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` fires. The first sweep runs immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep() {
                        warn!(error = %e, "reconciliation sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Only synced records expire; their age runs from when they were synced.
fn is_expired(record: &CaptureRecord, retain_after: DateTime<Utc>) -> bool {
    matches!(record.sync_state, SyncState::Synced)
        && record
            .synced_at
            .or(record.state_changed_at)
            .unwrap_or(record.created_at)
            < retain_after
}
