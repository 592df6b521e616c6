//! Sync queue: the pending-upload view over the record store.
//!
//! The queue owns no records. [`SyncQueue::next()`] selects from the store's
//! committed snapshot and claims the chosen id in an in-memory map, so two
//! workers can never hold the same record at once. A claim ends on
//! [`ack`](SyncQueue::ack), [`nack`](SyncQueue::nack),
//! [`settle`](SyncQueue::settle), [`cancel`](SyncQueue::cancel), or when it
//! outlives `claim_timeout` (a crashed or wedged worker).
//!
//! Every claim has its own [`ClaimId`]. Releasing by claim id is a no-op once
//! the claim expired, so a late holder can never release or overwrite the
//! work of whoever claimed the record after it.
//!
//! Each claim carries a [`CancellationToken`]. Deleting a record cancels its
//! token so the holder stops retrying.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::RecordStore;
use crate::types::{CaptureRecord, RecordId, SyncState, SyncStatus};
use crate::{MealSyncError, Result};

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a claim may be held before it is released. Must exceed the
    /// worst-case upload pass (attempts × (timeout + backoff)). Default: 10 min.
    pub claim_timeout: Duration,
    /// How long a failed record rests before `next()` offers it again.
    /// Default: 5 min.
    pub failed_cooldown: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(600),
            failed_cooldown: Duration::from_secs(300),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn failed_cooldown(mut self, cooldown: Duration) -> Self {
        self.failed_cooldown = cooldown;
        self
    }
}

/// Identifies one claim on a record, unique for the queue's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimId(u64);

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "claim-{}", self.0)
    }
}

/// A record handed to exactly one worker.
#[derive(Debug, Clone)]
pub struct ClaimedRecord {
    pub record: CaptureRecord,
    pub claim: ClaimId,
    /// Fires when the record is deleted or the claim is revoked.
    pub cancel: CancellationToken,
}

struct Claim {
    id: ClaimId,
    claimed_at: Instant,
    token: CancellationToken,
}

#[derive(Default)]
struct Claims {
    active: HashMap<RecordId, Claim>,
    /// Ids whose claim expired since the last `release_expired()` call.
    revoked: HashSet<RecordId>,
}

/// Ordered, single-flight view of records awaiting upload.
pub struct SyncQueue {
    store: Arc<RecordStore>,
    claims: Mutex<Claims>,
    next_claim: AtomicU64,
    notify: Notify,
    config: QueueConfig,
}

impl SyncQueue {
    pub fn new(store: Arc<RecordStore>, config: QueueConfig) -> Self {
        Self {
            store,
            claims: Mutex::new(Claims::default()),
            next_claim: AtomicU64::new(1),
            notify: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Persist a new pending record and wake idle workers.
    pub fn enqueue(&self, record: CaptureRecord) -> Result<()> {
        if record.status() != SyncStatus::Pending {
            return Err(MealSyncError::InvalidInput(format!(
                "record {} must be pending to enqueue",
                record.id
            )));
        }
        self.store.put(record)?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wake idle workers after records became eligible outside `enqueue`.
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Wait until woken by [`enqueue`](Self::enqueue) or [`wake`](Self::wake).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Claim the oldest eligible record.
    ///
    /// Eligible: `Pending`, or `Failed` with a non-permanent failure whose
    /// cooldown has passed. Claimed ids are skipped; expired claims are
    /// released first.
    pub fn next(&self) -> Option<ClaimedRecord> {
        self.next_except(&HashSet::new())
    }

    /// Like [`next`](Self::next), but never yields an id in `skip`.
    pub fn next_except(&self, skip: &HashSet<RecordId>) -> Option<ClaimedRecord> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        self.release_expired_locked(&mut claims);

        let cooldown = chrono::Duration::from_std(self.config.failed_cooldown)
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let record = self
            .store
            .list_by_states(&[SyncStatus::Pending, SyncStatus::Failed])
            .into_iter()
            .filter(|r| !claims.active.contains_key(&r.id) && !skip.contains(&r.id))
            .find(|r| match &r.sync_state {
                SyncState::Pending => true,
                SyncState::Failed { reason } => {
                    !reason.kind.is_permanent()
                        && reason.at.checked_add_signed(cooldown).is_none_or(|t| t <= now)
                }
                _ => false,
            })?;

        let claim = ClaimId(self.next_claim.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        claims.active.insert(
            record.id.clone(),
            Claim {
                id: claim,
                claimed_at: Instant::now(),
                token: token.clone(),
            },
        );
        debug!(id = %record.id, %claim, "claimed record");
        Some(ClaimedRecord {
            record,
            claim,
            cancel: token,
        })
    }

    /// Release `claim` after a successful upload. Returns whether it was
    /// still the active claim on `id`.
    pub fn ack(&self, id: &str, claim: ClaimId) -> bool {
        let released = self.take_claim(id, claim).is_some();
        if released {
            debug!(id, %claim, "acked record");
        }
        released
    }

    /// Release `claim` after a failed upload pass.
    ///
    /// The record's failure state is owned by the store; the queue only
    /// forgets the claim so a later pass can pick it up.
    pub fn nack(&self, id: &str, claim: ClaimId, error: &MealSyncError) -> bool {
        let released = self.take_claim(id, claim).is_some();
        if released {
            debug!(id, %claim, error = %error, "nacked record");
        }
        released
    }

    /// Write an upload outcome back and release `claim`, atomically with
    /// respect to other claims.
    ///
    /// `apply` runs only while `claim` is the active claim on `id` and the
    /// record is still `InFlight`. Returns whether it ran. A missing record
    /// releases the claim and returns `RecordNotFound`.
    pub fn settle<F>(&self, id: &str, claim: ClaimId, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut CaptureRecord),
    {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if !claims.active.get(id).is_some_and(|c| c.id == claim) {
            debug!(id, %claim, "claim no longer held, dropping outcome");
            return Ok(false);
        }

        let mut applied = false;
        let stored = self.store.update(id, |r| {
            if matches!(r.sync_state, SyncState::InFlight) {
                apply(r);
                applied = true;
            }
        });
        claims.active.remove(id);
        stored.map(|_| applied)
    }

    /// Drop `claim` without an outcome. No-op if another claim replaced it.
    pub fn release(&self, id: &str, claim: ClaimId) -> bool {
        self.take_claim(id, claim).is_some()
    }

    /// Cancel whatever claim holds `id` and drop it. Returns whether a claim
    /// existed. Used when the record itself goes away.
    pub fn cancel(&self, id: &str) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        match claims.active.remove(id) {
            Some(claim) => {
                claim.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_claimed(&self, id: &str) -> bool {
        let claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.active.contains_key(id)
    }

    /// Whether `claim` is still the active claim on `id`.
    pub fn holds(&self, id: &str, claim: ClaimId) -> bool {
        let claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.active.get(id).is_some_and(|c| c.id == claim)
    }

    /// Ids currently claimed by a worker.
    pub fn claimed_ids(&self) -> Vec<RecordId> {
        let claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.active.keys().cloned().collect()
    }

    /// Release every claim older than `claim_timeout`.
    ///
    /// Returns every id whose claim expired since the previous call,
    /// including ones released along the way by `next()`.
    pub fn release_expired(&self) -> Vec<RecordId> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        self.release_expired_locked(&mut claims);
        let revoked = std::mem::take(&mut claims.revoked);
        // An id may have been re-claimed since its old claim expired.
        revoked
            .into_iter()
            .filter(|id| !claims.active.contains_key(id))
            .collect()
    }

    fn release_expired_locked(&self, claims: &mut Claims) {
        let timeout = self.config.claim_timeout;
        let expired: Vec<RecordId> = claims
            .active
            .iter()
            .filter(|(_, c)| c.claimed_at.elapsed() >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(claim) = claims.active.remove(&id) {
                // The holder must not start another attempt once someone else may own the id.
                claim.token.cancel();
                warn!(id = %id, timeout_secs = timeout.as_secs(), "claim timed out, releasing");
                claims.revoked.insert(id);
            }
        }
    }

    fn take_claim(&self, id: &str, claim: ClaimId) -> Option<Claim> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if claims.active.get(id).is_some_and(|c| c.id == claim) {
            claims.active.remove(id)
        } else {
            None
        }
    }
}
