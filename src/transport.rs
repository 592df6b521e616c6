//! Client side of `POST /analyze`.
//!
//! [`AnalysisTransport`] is the seam the uploader talks through; the HTTP
//! implementation authenticates with a bearer token obtained from a
//! [`TokenProvider`] on every request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{error_for_status, retry_after_header};
use crate::types::{AnalyzeRequest, AnalyzeResponse, ErrorBody};
use crate::{MealSyncError, Result};

/// Default request timeout for uploads.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Source of bearer tokens (the app's auth/session layer).
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String>;
}

/// A fixed token, e.g. from an environment variable.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String> {
        if self.0.is_empty() {
            return Err(MealSyncError::AuthenticationFailed);
        }
        Ok(self.0.clone())
    }
}

/// Sends one analyze request. Implementations must not retry internally.
#[async_trait]
pub trait AnalysisTransport: Send + Sync {
    /// Transport name for logging/debugging.
    fn name(&self) -> &str;

    async fn submit(&self, request: &AnalyzeRequest) -> Result<AnalyzeResponse>;
}

/// HTTP transport for the orchestrator's `POST /analyze`.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpTransport {
    /// Create a transport for the server at `base_url`.
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_timeout(base_url, tokens, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Self {
        let http = Client::builder()
            .user_agent(crate::version::user_agent())
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }
}

#[async_trait]
impl AnalysisTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, request: &AnalyzeRequest) -> Result<AnalyzeResponse> {
        let token = self.tokens.bearer_token().await?;
        let url = format!("{}/analyze", self.base_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let retry_after = retry_after_header(response.headers());
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(error) => Err(error.into_error(retry_after)),
            // Proxies and load balancers answer without our error body.
            Err(_) => Err(error_for_status(
                status,
                retry_after,
                format!("analysis server returned {status}"),
            )),
        }
    }
}
