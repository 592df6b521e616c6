//! Error types and failure classification.
//!
//! Every failure in the pipeline is classified once, by [`MealSyncError::class()`],
//! into an [`ErrorClass`]. Retry and fallback decisions consult the class,
//! never the message text.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

/// How a failure should be treated by retry and fallback logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying cannot fix this (bad input, auth failure, content rejected).
    Terminal,
    /// Timeout, 5xx, connection loss: retry with backoff.
    Transient,
    /// Explicit rate-limit signal. Retryable regardless of status class.
    RateLimited { retry_after: Option<Duration> },
}

impl ErrorClass {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Terminal)
    }
}

/// Mealsync error types
#[derive(Debug, thiserror::Error)]
pub enum MealSyncError {
    // Network/provider errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("content rejected: {reason}")]
    ContentRejected { reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Soft errors
    #[error("provider returned no nutrition items")]
    EmptyResponse,

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// Structured error returned by the analysis server.
    #[error("server error ({code}): {message}")]
    Remote {
        code: String,
        message: String,
        retryable: bool,
        retry_after: Option<Duration>,
    },

    // Aggregate errors
    /// Retry dispatcher ran out of attempts; `last` is the final failure.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<MealSyncError>,
    },

    /// Every provider in the fallback chain failed.
    #[error("analysis failed after trying {tried} provider(s): {last}")]
    ProvidersExhausted {
        tried: usize,
        last: Box<MealSyncError>,
    },

    #[error("no analysis provider configured")]
    NoProvider,

    #[error("operation cancelled")]
    Cancelled,

    // Local storage errors
    #[error("capture record not found: {0}")]
    RecordNotFound(String),

    #[error("capture record already exists: {0}")]
    DuplicateRecord(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MealSyncError {
    /// Classify this error for retry and fallback decisions.
    ///
    /// Aggregate errors report the class of the failure they wrap.
    pub fn class(&self) -> ErrorClass {
        match self {
            MealSyncError::Http(_)
            | MealSyncError::Timeout(_)
            | MealSyncError::EmptyResponse
            | MealSyncError::MalformedResponse(_) => ErrorClass::Transient,
            MealSyncError::Api { status, .. } => {
                if *status == 408 || *status >= 500 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Terminal
                }
            }
            MealSyncError::RateLimited { retry_after } => ErrorClass::RateLimited {
                retry_after: *retry_after,
            },
            MealSyncError::Remote {
                code,
                retryable,
                retry_after,
                ..
            } => {
                if !retryable {
                    ErrorClass::Terminal
                } else if code == "rate_limited" {
                    ErrorClass::RateLimited {
                        retry_after: *retry_after,
                    }
                } else {
                    ErrorClass::Transient
                }
            }
            MealSyncError::Exhausted { last, .. }
            | MealSyncError::ProvidersExhausted { last, .. } => last.class(),
            MealSyncError::AuthenticationFailed
            | MealSyncError::ContentRejected { .. }
            | MealSyncError::InvalidInput(_)
            | MealSyncError::NoProvider
            | MealSyncError::Cancelled
            | MealSyncError::RecordNotFound(_)
            | MealSyncError::DuplicateRecord(_)
            | MealSyncError::Storage(_)
            | MealSyncError::Json(_)
            | MealSyncError::Configuration(_) => ErrorClass::Terminal,
        }
    }

    /// Whether this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        self.class().is_retryable()
    }

    /// Server-provided retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.class() {
            ErrorClass::RateLimited { retry_after } => retry_after,
            _ => None,
        }
    }

    /// Whether the orchestrator should move on to the next provider.
    ///
    /// Timeouts, 5xx, rate limits, and empty or unparseable results advance
    /// the chain. Terminal errors stop it.
    pub fn is_fallback_trigger(&self) -> bool {
        self.is_transient()
    }

    /// Whether the failure is a rejection of the capture itself.
    ///
    /// Resubmitting the identical payload can never succeed, so such records
    /// wait for a manual retry instead of being requeued automatically.
    pub fn is_permanent_rejection(&self) -> bool {
        match self {
            MealSyncError::InvalidInput(_) | MealSyncError::ContentRejected { .. } => true,
            MealSyncError::Api { status, .. } => {
                matches!(*status, 400 | 413 | 415 | 422 | 451)
            }
            MealSyncError::Remote {
                code, retryable, ..
            } => !retryable && matches!(code.as_str(), "invalid_input" | "content_rejected"),
            MealSyncError::Exhausted { last, .. }
            | MealSyncError::ProvidersExhausted { last, .. } => last.is_permanent_rejection(),
            _ => false,
        }
    }

    /// Stable machine-readable code used in error bodies and failure metadata.
    pub fn code(&self) -> &str {
        match self {
            MealSyncError::Http(_) => "network_error",
            MealSyncError::Api { status, .. } if *status >= 500 => "upstream_error",
            MealSyncError::Api { .. } => "request_rejected",
            MealSyncError::Timeout(_) => "timeout",
            MealSyncError::RateLimited { .. } => "rate_limited",
            MealSyncError::AuthenticationFailed => "unauthorized",
            MealSyncError::ContentRejected { .. } => "content_rejected",
            MealSyncError::InvalidInput(_) => "invalid_input",
            MealSyncError::EmptyResponse => "empty_result",
            MealSyncError::MalformedResponse(_) => "malformed_response",
            MealSyncError::Remote { code, .. } => code,
            MealSyncError::Exhausted { last, .. } => last.code(),
            // A rejected photo stays a rejection for the client.
            MealSyncError::ProvidersExhausted { last, .. } if last.is_permanent_rejection() => {
                last.code()
            }
            MealSyncError::ProvidersExhausted { .. } => "providers_exhausted",
            MealSyncError::NoProvider => "no_provider",
            MealSyncError::Cancelled => "cancelled",
            MealSyncError::RecordNotFound(_) => "not_found",
            MealSyncError::DuplicateRecord(_) => "duplicate",
            MealSyncError::Storage(_) => "storage_error",
            MealSyncError::Json(_) => "invalid_json",
            MealSyncError::Configuration(_) => "configuration_error",
        }
    }
}

impl From<reqwest::Error> for MealSyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not report the configured deadline
            MealSyncError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            MealSyncError::MalformedResponse(err.to_string())
        } else {
            MealSyncError::Http(err.to_string())
        }
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub(crate) fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success HTTP status to an error.
///
/// 429 maps to `RateLimited` even though it is a 4xx status.
pub(crate) fn error_for_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    message: String,
) -> MealSyncError {
    match status.as_u16() {
        401 | 403 => MealSyncError::AuthenticationFailed,
        429 => MealSyncError::RateLimited { retry_after },
        400 | 413 | 422 => MealSyncError::InvalidInput(message),
        451 => MealSyncError::ContentRejected { reason: message },
        code => MealSyncError::Api {
            status: code,
            message,
        },
    }
}

/// Result type alias for mealsync operations
pub type Result<T> = std::result::Result<T, MealSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_many_requests_is_rate_limited_not_terminal() {
        let err = error_for_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
            String::new(),
        );
        assert_eq!(
            err.class(),
            ErrorClass::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
    }

    #[test]
    fn client_errors_are_terminal() {
        for status in [400u16, 401, 403, 404, 413, 422, 451] {
            let err = error_for_status(
                StatusCode::from_u16(status).unwrap(),
                None,
                "nope".into(),
            );
            assert_eq!(err.class(), ErrorClass::Terminal, "status {status}");
        }
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [408u16, 500, 502, 503, 504] {
            let err = error_for_status(StatusCode::from_u16(status).unwrap(), None, String::new());
            assert_eq!(err.class(), ErrorClass::Transient, "status {status}");
        }
    }

    #[test]
    fn retry_after_header_parses_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after_header(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after_header(&headers), None);
    }
}
