//! Error types for the artifact and composition pipeline

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while caching, composing or running a model
#[derive(Debug, Error)]
pub enum LmmError {
    /// Missing access token, missing required key in a configuration file,
    /// or an invalid runtime configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing manifest key, failed archive extraction, or a required
    /// cache file that is not on disk
    #[error("Model artifact error: {0}")]
    Artifact(String),

    /// The remote API answered with an error or could not be reached
    #[error("API request failed: {0}")]
    Api(String),

    /// Encoding, generation or decoding produced an unusable result
    #[error("Inference error: {0}")]
    Inference(String),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image decoding failed: {0}")]
    Image(#[from] image::ImageError),

    /// Failure reported by a compute or processor collaborator
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl LmmError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this is one of the two fatal taxonomy kinds raised by the
    /// load pipeline itself
    pub fn is_artifact(&self) -> bool {
        matches!(self, Self::Artifact(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

pub type LmmResult<T> = Result<T, LmmError>;
