//! Public types for the capture pipeline.

mod nutrition;
mod record;
mod wire;

pub use nutrition::{AnalysisResult, NutritionItem, Totals};
pub use record::{
    CapturePayload, CaptureRecord, FailureInfo, FailureKind, RecordId, SyncState, SyncStatus,
    new_record_id,
};
pub use wire::{AnalyzeRequest, AnalyzeResponse, ErrorBody};
