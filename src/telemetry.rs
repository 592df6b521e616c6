//! Telemetry metric name constants.
//!
//! Centralised metric names for mealsync operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `mealsync_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `provider`: analysis provider name (e.g. "gemini", "edamam")
//! - `operation`: what the retry dispatcher was running (e.g. "upload")
//! - `status`: outcome: "ok" or "error"
//! - `reason`: error code that caused a fallback or failure

/// Retry attempts (not counting the initial attempt).
///
/// Labels: `operation`.
pub const RETRIES_TOTAL: &str = "mealsync_retries_total";

/// Upload passes completed by the uploader.
///
/// Labels: `status` ("ok" | "error" | "discarded").
pub const UPLOADS_TOTAL: &str = "mealsync_uploads_total";

/// Provider calls made by the orchestrator.
///
/// Labels: `provider`, `status` ("ok" | "error").
pub const PROVIDER_REQUESTS_TOTAL: &str = "mealsync_provider_requests_total";

/// Provider call duration in seconds.
///
/// Labels: `provider`.
pub const PROVIDER_DURATION_SECONDS: &str = "mealsync_provider_duration_seconds";

/// Advances to the next provider in the fallback chain.
///
/// Labels: `provider` (the one that failed), `reason`.
pub const PROVIDER_FALLBACKS_TOTAL: &str = "mealsync_provider_fallbacks_total";

/// Records moved back to pending by reconciliation.
pub const RECONCILE_REQUEUED_TOTAL: &str = "mealsync_reconcile_requeued_total";

/// Synced records deleted by retention pruning.
pub const RECONCILE_PRUNED_TOTAL: &str = "mealsync_reconcile_pruned_total";

/// Analyze requests answered from an earlier result for the same id.
pub const IDEMPOTENT_HITS_TOTAL: &str = "mealsync_idempotent_hits_total";
