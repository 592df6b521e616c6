//! Configuration loading for the `mealsync` CLI.
//!
//! Resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.mealsync/client.toml` (user)
//!
//! Without a file the built-in defaults are used. The bearer token is never
//! read from this file; it comes from `MEALSYNC_TOKEN`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::pipeline::PipelineBuilder;
use crate::queue::QueueConfig;
use crate::reconcile::ReconcileConfig;
use crate::retry::RetryPolicy;
use crate::store::default_data_dir;
use crate::{MealSyncError, Result};

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Analysis server base URL (default: http://127.0.0.1:8787).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Data directory (default: platform data dir + `mealsync`).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Upload workers, 1 to 4 (default: 2).
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            data_dir: None,
            workers: default_workers(),
            retry: RetrySettings::default(),
            queue: QueueSettings::default(),
            reconcile: ReconcileSettings::default(),
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_workers() -> usize {
    2
}

/// Upload retry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Claim and cooldown settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    #[serde(default = "default_failed_cooldown_secs")]
    pub failed_cooldown_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            claim_timeout_secs: default_claim_timeout_secs(),
            failed_cooldown_secs: default_failed_cooldown_secs(),
        }
    }
}

fn default_claim_timeout_secs() -> u64 {
    600
}

fn default_failed_cooldown_secs() -> u64 {
    300
}

/// Sweep settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_interval_secs() -> u64 {
    180
}

fn default_retention_days() -> u64 {
    30
}

impl ClientConfig {
    /// Load configuration from `explicit_path` or `~/.mealsync/client.toml`.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = match explicit_path {
            Some(path) if path.exists() => path.to_path_buf(),
            Some(path) => {
                return Err(MealSyncError::Configuration(format!(
                    "Config file not found: {path:?}"
                )));
            }
            None => match dirs::home_dir().map(|h| h.join(".mealsync").join("client.toml")) {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let content = fs::read_to_string(&path).map_err(|e| {
            MealSyncError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            MealSyncError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .max_attempts(self.retry.max_attempts)
            .initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new()
            .claim_timeout(Duration::from_secs(self.queue.claim_timeout_secs))
            .failed_cooldown(Duration::from_secs(self.queue.failed_cooldown_secs))
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig::new()
            .interval(Duration::from_secs(self.reconcile.interval_secs))
            .retention_days(self.reconcile.retention_days)
    }

    /// A pipeline builder preloaded with everything but the token provider.
    pub fn pipeline_builder(&self) -> PipelineBuilder {
        PipelineBuilder::new()
            .data_dir(self.data_dir())
            .endpoint(&self.endpoint)
            .workers(self.workers)
            .retry_policy(self.retry_policy())
            .queue_config(self.queue_config())
            .reconcile_config(self.reconcile_config())
    }
}
