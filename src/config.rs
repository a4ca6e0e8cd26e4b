//! Runtime configuration and loading logic
//!
//! One `RuntimeConfig` is built at process start and shared by every model
//! instance. Nothing in the crate mutates it afterwards.

use crate::device::{self, Device};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide settings for the artifact and composition pipeline
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root of the per-model cache directories
    pub cache_dir: PathBuf,
    /// Base URL of the model metadata API
    pub api_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Token for gated HuggingFace repositories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub huggingface_token: Option<String>,
    /// Explicit device ("cpu", "cuda:0", "mps"); autodetected when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Identifier reported to the API when resolving manifests
    pub device_id: String,
    /// A single file taking longer than this refreshes the signed manifest
    pub slow_download_threshold_secs: u64,
    /// Upper bound on one HTTP request
    pub request_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            api_url: default_api_url(),
            api_key: None,
            huggingface_token: None,
            device: None,
            device_id: default_device_id(),
            slow_download_threshold_secs: default_slow_download_threshold(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(cache_dir) = std::env::var("MODEL_CACHE_DIR") {
            config.cache_dir = PathBuf::from(cache_dir);
        }
        if let Ok(api_url) = std::env::var("API_BASE_URL") {
            config.api_url = api_url;
        }
        if let Ok(api_key) = std::env::var("ROBOFLOW_API_KEY") {
            config.api_key = Some(api_key);
        }
        if let Ok(token) = std::env::var("HUGGINGFACE_TOKEN") {
            config.huggingface_token = Some(token);
        }
        if let Ok(device) = std::env::var("DEVICE") {
            config.device = Some(device);
        }
        if let Ok(device_id) = std::env::var("DEVICE_ID") {
            config.device_id = device_id;
        }
        if let Ok(secs) = std::env::var("LMM_SLOW_DOWNLOAD_SECS") {
            config.slow_download_threshold_secs = secs
                .parse()
                .context("Invalid LMM_SLOW_DOWNLOAD_SECS value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.slow_download_threshold_secs == 0 {
            anyhow::bail!("slow_download_threshold_secs must be greater than zero");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than zero");
        }
        if self.api_url.trim().is_empty() {
            anyhow::bail!("api_url cannot be empty");
        }
        if let Some(device) = &self.device {
            device.parse::<Device>().map_err(|e| anyhow::anyhow!(e))?;
        }

        std::fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("Cannot create cache directory: {:?}", self.cache_dir))?;

        Ok(())
    }

    /// Resolve device placement; call once and keep the result
    pub fn resolve_device(&self) -> Result<Device> {
        device::resolve_device(self.device.as_deref()).map_err(|e| anyhow::anyhow!(e))
    }

    pub fn slow_download_threshold(&self) -> Duration {
        Duration::from_secs(self.slow_download_threshold_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Where hub-sourced base models are cached
    pub fn hub_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("huggingface")
    }
}

// Default functions
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("lmm-compose"))
        .unwrap_or_else(|| PathBuf::from("/tmp/cache"))
}
fn default_api_url() -> String {
    "https://api.roboflow.com".to_string()
}
fn default_device_id() -> String {
    "local".to_string()
}
fn default_slow_download_threshold() -> u64 {
    120
}
fn default_request_timeout() -> u64 {
    3600
}
