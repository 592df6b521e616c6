//! Request handlers.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, header::AUTHORIZATION},
};
use serde::Serialize;

use super::error::ApiError;
use super::state::AppState;
use crate::types::{AnalyzeRequest, AnalyzeResponse};
use crate::MealSyncError;

/// `POST /analyze`: analyze an image or accept manual items, once per id.
pub async fn analyze_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    state.authorize(authorization)?;

    let Json(request) =
        payload.map_err(|rejection| MealSyncError::InvalidInput(rejection.body_text()))?;
    let id = request.id.clone();
    let result = state.analyze(request).await?;
    Ok(Json(AnalyzeResponse::new(id, &result)))
}

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: String,
    pub providers: Vec<String>,
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: crate::version_string(),
        providers: state
            .orchestrator()
            .provider_names()
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}
