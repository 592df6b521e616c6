//! HTTP mapping for pipeline errors.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::error::ErrorClass;
use crate::types::ErrorBody;
use crate::MealSyncError;

/// A handler error rendered as `{code, message, retryable}`.
#[derive(Debug)]
pub struct ApiError(pub MealSyncError);

impl From<MealSyncError> for ApiError {
    fn from(err: MealSyncError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_for(&self.0)
    }
}

fn status_for(err: &MealSyncError) -> StatusCode {
    match err {
        MealSyncError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        MealSyncError::InvalidInput(_) | MealSyncError::Json(_) => StatusCode::BAD_REQUEST,
        MealSyncError::ContentRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        MealSyncError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        MealSyncError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        MealSyncError::NoProvider => StatusCode::SERVICE_UNAVAILABLE,
        MealSyncError::ProvidersExhausted { last, .. } if last.is_permanent_rejection() => {
            status_for(last)
        }
        MealSyncError::ProvidersExhausted { .. } | MealSyncError::Remote { .. } => {
            match err.class() {
                ErrorClass::Terminal => StatusCode::BAD_GATEWAY,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            }
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "analyze request failed");
        }

        let body = ErrorBody::from_error(&self.0);
        let retry_after = body
            .retry_after_secs
            .and_then(|secs| HeaderValue::from_str(&secs.to_string()).ok());

        let mut response = (status, Json(body)).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        response
    }
}
