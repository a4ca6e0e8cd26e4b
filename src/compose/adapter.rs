//! Adapter configuration (PEFT `adapter_config.json`)

use super::patcher::{ADAPTER_CONFIG_FILE, normalize_adapter_config};
use crate::error::{LmmError, LmmResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Modules the adapter applies to: an explicit list or a regex over
/// module names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

/// Parsed adapter configuration.
///
/// Only the fields the composition engine reads are typed; everything else
/// is carried verbatim in `extra` and handed to the compute runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Base model reference (`<vendor>/<family>` or a hub repository)
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_alpha: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_modules: Option<TargetModules>,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AdapterConfig {
    /// Normalize `adapter_config.json` in `dir` and parse it
    pub fn load(dir: &Path) -> LmmResult<Self> {
        let path = dir.join(ADAPTER_CONFIG_FILE);
        normalize_adapter_config(&path)?;

        let content = std::fs::read_to_string(&path).map_err(|e| LmmError::io(&path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.base_model()?;

        tracing::debug!(
            base_model = ?config.base_model_name_or_path,
            revision = ?config.revision,
            r = ?config.r,
            "Loaded adapter config"
        );
        Ok(config)
    }

    /// Base model reference; a configuration error when absent
    pub fn base_model(&self) -> LmmResult<&str> {
        match self.base_model_name_or_path.as_deref() {
            Some(base) if !base.trim().is_empty() => Ok(base),
            _ => Err(LmmError::configuration(format!(
                "'base_model_name_or_path' not found in {}",
                ADAPTER_CONFIG_FILE
            ))),
        }
    }

    /// Revision of the base, `main` when unset
    pub fn base_revision(&self) -> &str {
        self.revision.as_deref().unwrap_or("main")
    }

    /// LoRA scaling factor: alpha / r, or alpha / sqrt(r) for rsLoRA.
    /// `None` when either parameter is missing.
    pub fn scaling(&self) -> Option<f32> {
        let r = self.r.filter(|r| *r > 0)? as f32;
        let alpha = self.lora_alpha?;
        Some(if self.use_rslora { alpha / r.sqrt() } else { alpha / r })
    }
}
