//! Model descriptor built from caller input

use crate::compose::dtype::Dtype;
use crate::error::{LmmError, LmmResult};
use serde::{Deserialize, Serialize};

/// What to load: identifier plus precision and quantization requests.
///
/// Built with the `with_*` methods before loading starts; the pipeline only
/// ever borrows it immutably.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dtype: Option<Dtype>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quantize: Option<bool>,
    #[serde(default)]
    core_model: bool,
}

impl ModelDescriptor {
    /// Create a descriptor from a model id.
    ///
    /// Ids of the form `dataset/version` carry their version in the second
    /// segment; bare ids have none.
    pub fn new(model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        let version = match model_id.split_once('/') {
            Some((_, version)) if !version.is_empty() && !version.contains('/') => {
                Some(version.to_string())
            }
            _ => None,
        };
        Self {
            model_id,
            version,
            revision: None,
            dtype: None,
            quantize: None,
            core_model: false,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_quantization(mut self, quantize: bool) -> Self {
        self.quantize = Some(quantize);
        self
    }

    /// Resolve weights through the core-model endpoint
    pub fn as_core_model(mut self) -> Self {
        self.core_model = true;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    pub fn dtype(&self) -> Option<Dtype> {
        self.dtype
    }

    pub fn quantize(&self) -> Option<bool> {
        self.quantize
    }

    pub fn is_core_model(&self) -> bool {
        self.core_model
    }

    /// Key of this model's cache directory
    pub fn cache_key(&self) -> &str {
        &self.model_id
    }

    /// Reject ids that would escape the cache root
    pub fn validate(&self) -> LmmResult<()> {
        if self.model_id.trim().is_empty() {
            return Err(LmmError::configuration("Model id cannot be empty"));
        }
        if self.model_id.starts_with('/')
            || self.model_id.contains('\\')
            || self.model_id.split('/').any(|segment| segment == "..")
        {
            return Err(LmmError::configuration(format!(
                "Model id '{}' cannot contain path traversal",
                self.model_id
            )));
        }
        Ok(())
    }
}
