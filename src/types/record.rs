//! Capture records: the unit of durable, idempotent upload work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::nutrition::{AnalysisResult, NutritionItem};
use crate::MealSyncError;

/// Client-generated record identifier, the idempotency key for uploads.
pub type RecordId = String;

/// Generate a new record id. Called once, at capture time.
pub fn new_record_id() -> RecordId {
    Uuid::new_v4().to_string()
}

/// What was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CapturePayload {
    /// Image bytes stored in the blob directory under `blob`.
    #[serde(rename_all = "camelCase")]
    Image { blob: String, content_type: String },
    /// Manually entered items; analysis is skipped.
    Items { items: Vec<NutritionItem> },
}

/// Why the last upload pass failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// The payload itself was rejected. Waits for manual retry or deletion.
    Rejected,
    /// Credentials were refused. Retried later; the token may refresh.
    Unauthorized,
    /// Retryable failures ran out of attempts.
    Exhausted,
    /// Anything else that stopped the pass.
    Other,
}

impl FailureKind {
    /// Whether automatic requeueing is pointless for this failure.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FailureKind::Rejected)
    }
}

/// Classified failure metadata kept on a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    pub at: DateTime<Utc>,
}

impl FailureInfo {
    /// Capture the classification of `err` at time `at`.
    pub fn from_error(err: &MealSyncError, at: DateTime<Utc>) -> Self {
        let kind = if err.is_permanent_rejection() {
            FailureKind::Rejected
        } else if matches!(err.code(), "unauthorized") {
            FailureKind::Unauthorized
        } else if err.is_transient() {
            FailureKind::Exhausted
        } else {
            FailureKind::Other
        };
        Self {
            kind,
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_transient(),
            at,
        }
    }
}

/// Upload state of a record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncState {
    #[default]
    Pending,
    InFlight,
    Synced,
    Failed {
        reason: FailureInfo,
    },
}

/// Field-less view of [`SyncState`], for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Pending,
    InFlight,
    Synced,
    Failed,
}

impl SyncState {
    pub fn status(&self) -> SyncStatus {
        match self {
            SyncState::Pending => SyncStatus::Pending,
            SyncState::InFlight => SyncStatus::InFlight,
            SyncState::Synced => SyncStatus::Synced,
            SyncState::Failed { .. } => SyncStatus::Failed,
        }
    }
}

/// One user-initiated meal capture awaiting durable processing.
///
/// Unknown fields in persisted JSON are ignored and missing optional fields
/// are defaulted, so stores written by other app versions still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub payload: CapturePayload,
    #[serde(default)]
    pub sync_state: SyncState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<FailureInfo>,
    /// When `sync_state` last changed.
    #[serde(default)]
    pub state_changed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    /// Canonical analysis returned by the server once synced.
    #[serde(default)]
    pub result: Option<AnalysisResult>,
}

impl CaptureRecord {
    /// Create a pending record with a freshly generated id.
    pub fn new(payload: CapturePayload) -> Self {
        Self::with_id(new_record_id(), payload)
    }

    /// Create a pending record with a caller-supplied id.
    pub fn with_id(id: impl Into<RecordId>, payload: CapturePayload) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            payload,
            sync_state: SyncState::Pending,
            attempts: 0,
            last_error: None,
            state_changed_at: Some(now),
            synced_at: None,
            result: None,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.sync_state.status()
    }

    /// Move to `state`, stamping the transition time.
    pub fn transition(&mut self, state: SyncState, at: DateTime<Utc>) {
        self.sync_state = state;
        self.state_changed_at = Some(at);
    }

    /// Failure metadata if the record is currently failed.
    pub fn failure(&self) -> Option<&FailureInfo> {
        match &self.sync_state {
            SyncState::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Blob file name for image captures.
    pub fn blob(&self) -> Option<&str> {
        match &self.payload {
            CapturePayload::Image { blob, .. } => Some(blob),
            CapturePayload::Items { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_records_are_pending_with_unique_ids() {
        let a = CaptureRecord::new(CapturePayload::Items { items: vec![] });
        let b = CaptureRecord::new(CapturePayload::Items { items: vec![] });
        assert_ne!(a.id, b.id);
        assert_eq!(a.status(), SyncStatus::Pending);
        assert_eq!(a.attempts, 0);
    }

    #[test]
    fn missing_fields_default_and_unknown_fields_are_ignored() {
        let json = r#"{
            "id": "abc",
            "createdAt": "2026-01-02T03:04:05Z",
            "payload": {"type": "image", "blob": "abc.jpg", "contentType": "image/jpeg"},
            "someFutureField": {"nested": true}
        }"#;
        let record: CaptureRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "abc");
        assert_eq!(record.sync_state, SyncState::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.blob(), Some("abc.jpg"));
    }

    #[test]
    fn failed_state_round_trips_reason() {
        let mut record = CaptureRecord::with_id("r1", CapturePayload::Items { items: vec![] });
        let reason = FailureInfo::from_error(&MealSyncError::AuthenticationFailed, Utc::now());
        record.transition(
            SyncState::Failed {
                reason: reason.clone(),
            },
            Utc::now(),
        );
        let json = serde_json::to_string(&record).unwrap();
        let back: CaptureRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.failure(), Some(&reason));
        assert_eq!(back.status(), SyncStatus::Failed);
    }

    #[test]
    fn failure_kind_follows_classification() {
        let now = Utc::now();
        let rejected = FailureInfo::from_error(&MealSyncError::InvalidInput("x".into()), now);
        assert_eq!(rejected.kind, FailureKind::Rejected);
        assert!(rejected.kind.is_permanent());

        let auth = FailureInfo::from_error(&MealSyncError::AuthenticationFailed, now);
        assert_eq!(auth.kind, FailureKind::Unauthorized);
        assert!(!auth.kind.is_permanent());

        let exhausted = FailureInfo::from_error(
            &MealSyncError::Exhausted {
                attempts: 5,
                last: Box::new(MealSyncError::Timeout(std::time::Duration::from_secs(30))),
            },
            now,
        );
        assert_eq!(exhausted.kind, FailureKind::Exhausted);
        assert!(exhausted.retryable);
    }
}
