//! HTTP analysis server.
//!
//! - `POST /analyze` runs the [`AnalysisOrchestrator`] once per record id
//! - `GET /health` reports the version and provider chain
//!
//! Configuration lives in [`config`]; state and idempotency in [`state`].

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal::{self, ctrl_c};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::orchestrator::{AnalysisOrchestrator, OrchestratorConfig};
use crate::{MealSyncError, Result};
use config::{Config, Secrets};

pub use error::ApiError;
pub use state::{AppState, MemoryResultSink, ResultSink};

/// Slack for the JSON envelope around a base64 image.
const BODY_OVERHEAD: usize = 64 * 1024;

/// Build the router. The body limit admits a base64 image of `max_image_bytes`.
pub fn router(state: AppState) -> Router {
    let max_image = state.orchestrator().config().max_image_bytes;
    let body_limit = max_image.saturating_mul(4) / 3 + BODY_OVERHEAD;

    Router::new()
        .route("/analyze", post(routes::analyze_handler))
        .route("/health", get(routes::health_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Assemble the provider chain from configuration.
///
/// Providers without credentials are skipped with a warning; an empty chain
/// is a configuration error.
pub fn build_orchestrator(config: &Config, secrets: &Secrets) -> Result<AnalysisOrchestrator> {
    let mut orchestrator = AnalysisOrchestrator::new(
        OrchestratorConfig::new().max_image_bytes(config.server.max_image_bytes),
    );

    for name in &config.providers.order {
        match name.as_str() {
            #[cfg(feature = "gemini")]
            "gemini" => {
                let Some(key) = secrets.gemini_api_key() else {
                    warn!("gemini listed but no API key configured, skipping");
                    continue;
                };
                let settings = config.providers.gemini.clone().unwrap_or_default();
                let mut provider = match &settings.base_url {
                    Some(url) => crate::providers::GeminiProvider::with_base_url(key, url),
                    None => crate::providers::GeminiProvider::new(key),
                };
                if let Some(model) = settings.model.clone() {
                    provider = provider.model(model);
                }
                if let Some(timeout) = settings.timeout() {
                    provider = provider.with_timeout(timeout);
                }
                orchestrator.add_provider(Arc::new(provider));
            }
            #[cfg(feature = "edamam")]
            "edamam" => {
                let Some((app_id, app_key)) = secrets.edamam_credentials() else {
                    warn!("edamam listed but no credentials configured, skipping");
                    continue;
                };
                let settings = config.providers.edamam.clone().unwrap_or_default();
                let mut provider = match &settings.base_url {
                    Some(url) => crate::providers::EdamamProvider::with_base_url(app_id, app_key, url),
                    None => crate::providers::EdamamProvider::new(app_id, app_key),
                };
                if let Some(timeout) = settings.timeout() {
                    provider = provider.with_timeout(timeout);
                }
                orchestrator.add_provider(Arc::new(provider));
            }
            #[cfg(not(feature = "gemini"))]
            "gemini" => warn!("gemini support not compiled in, skipping"),
            #[cfg(not(feature = "edamam"))]
            "edamam" => warn!("edamam support not compiled in, skipping"),
            other => {
                return Err(MealSyncError::Configuration(format!(
                    "unknown provider '{other}'"
                )));
            }
        }
    }

    if orchestrator.provider_names().is_empty() {
        return Err(MealSyncError::NoProvider);
    }
    Ok(orchestrator)
}

/// Bind and serve until Ctrl+C or SIGTERM.
pub async fn serve(address: &str, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(address).await.map_err(|e| {
        MealSyncError::Configuration(format!("failed to bind {address}: {e}"))
    })?;
    info!(%address, "analysis server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| MealSyncError::Http(format!("server error: {e}")))?;

    info!("analysis server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(e) => {
                warn!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
