//! Configuration loading for mealsyncd.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.mealsync/server.toml` (user)
//! 3. `/etc/mealsync/server.toml` (system)
//!
//! Without any file the built-in defaults are used.
//!
//! Secrets are loaded separately with mandatory permission checks:
//! 1. `~/.mealsync/secrets.toml` (user, must be 0600)
//! 2. `/etc/mealsync/secrets.toml` (system, must be 0600)
//!
//! Each provider credential falls back to its environment variable.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::{MealSyncError, Result};

/// Server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Server network configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 127.0.0.1:8787).
    #[serde(default = "default_address")]
    pub address: String,
    /// Largest accepted image in bytes (default: 10 MiB).
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
    /// Bearer tokens accepted on `/analyze`. Empty accepts any non-empty token.
    #[serde(default)]
    pub auth_tokens: Vec<String>,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            max_image_bytes: default_max_image_bytes(),
            auth_tokens: Vec::new(),
            idempotency: IdempotencyConfig::default(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

/// How long results are remembered per record id.
#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    /// Seconds a result stays cached after it was produced (default: 86400).
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    /// Maximum cached results (default: 10000).
    #[serde(default = "default_capacity")]
    pub capacity: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            capacity: default_capacity(),
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_ttl() -> u64 {
    24 * 60 * 60
}

fn default_capacity() -> u64 {
    10_000
}

/// Provider configurations.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    /// Fallback order by provider name (default: gemini, then edamam).
    #[serde(default = "default_order")]
    pub order: Vec<String>,
    #[serde(default)]
    pub gemini: Option<ProviderConfig>,
    #[serde(default)]
    pub edamam: Option<ProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            order: default_order(),
            gemini: None,
            edamam: None,
        }
    }
}

fn default_order() -> Vec<String> {
    vec!["gemini".to_string(), "edamam".to_string()]
}

/// Per-provider overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    /// Model identifier (Gemini only).
    #[serde(default)]
    pub model: Option<String>,
    /// API base URL override.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-call deadline in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Secrets configuration (provider credentials).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub gemini: Option<ApiKeySecret>,
    #[serde(default)]
    pub edamam: Option<AppKeySecret>,
}

/// A single API key secret.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeySecret {
    pub api_key: String,
}

/// An application id + key pair.
#[derive(Debug, Clone, Deserialize)]
pub struct AppKeySecret {
    pub app_id: String,
    pub app_key: String,
}

const GEMINI_API_KEY_VAR: &str = "GEMINI_API_KEY";
const EDAMAM_APP_ID_VAR: &str = "EDAMAM_APP_ID";
const EDAMAM_APP_KEY_VAR: &str = "EDAMAM_APP_KEY";

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided; missing is an error)
    /// 2. `~/.mealsync/server.toml`
    /// 3. `/etc/mealsync/server.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let Some(path) = Self::resolve_config_path(explicit_path)? else {
            info!("no config file found, using defaults");
            return Ok(Config::default());
        };
        let content = fs::read_to_string(&path).map_err(|e| {
            MealSyncError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::parse(&content).map_err(|e| {
            MealSyncError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(MealSyncError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".mealsync").join("server.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/mealsync/server.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }
}

impl Secrets {
    /// Load secrets from the standard locations with permission checks.
    ///
    /// Resolution order:
    /// 1. `~/.mealsync/secrets.toml` (if exists, must be 0600)
    /// 2. `/etc/mealsync/secrets.toml` (if exists, must be 0600)
    ///
    /// Returns empty secrets if no file exists (providers may use env vars).
    pub fn load() -> Result<Self> {
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(".mealsync").join("secrets.toml");
            if user_secrets.exists() {
                Self::check_permissions(&user_secrets)?;
                return Self::load_from_file(&user_secrets);
            }
        }

        let system_secrets = PathBuf::from("/etc/mealsync/secrets.toml");
        if system_secrets.exists() {
            Self::check_permissions(&system_secrets)?;
            return Self::load_from_file(&system_secrets);
        }

        Ok(Secrets::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            MealSyncError::Configuration(format!("Failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            MealSyncError::Configuration(format!("Failed to parse secrets file {path:?}: {e}"))
        })
    }

    /// Check that the secrets file has secure permissions (0600 or 0400).
    #[cfg(unix)]
    pub fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).map_err(|e| {
            MealSyncError::Configuration(format!("Failed to stat secrets file {path:?}: {e}"))
        })?;

        let mode = metadata.permissions().mode();
        // Reject if group or other bits are set
        if mode & 0o077 != 0 {
            return Err(MealSyncError::Configuration(format!(
                "Secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
                mode & 0o777
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    pub fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }

    /// Gemini API key, falling back to `GEMINI_API_KEY`.
    pub fn gemini_api_key(&self) -> Option<String> {
        self.gemini
            .as_ref()
            .map(|s| s.api_key.clone())
            .or_else(|| std::env::var(GEMINI_API_KEY_VAR).ok())
            .filter(|k| !k.is_empty())
    }

    /// Edamam `(app_id, app_key)`, falling back to `EDAMAM_APP_ID`/`EDAMAM_APP_KEY`.
    pub fn edamam_credentials(&self) -> Option<(String, String)> {
        if let Some(s) = &self.edamam {
            return Some((s.app_id.clone(), s.app_key.clone()));
        }
        let id = std::env::var(EDAMAM_APP_ID_VAR).ok()?;
        let key = std::env::var(EDAMAM_APP_KEY_VAR).ok()?;
        (!id.is_empty() && !key.is_empty()).then_some((id, key))
    }
}
