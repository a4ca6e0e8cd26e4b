//! Composition state machine

use serde::{Deserialize, Serialize};

/// Stage of the composition pipeline, in the order they are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionStage {
    Uninitialized,
    /// Every required file is in the model cache directory
    ArtifactsCached,
    /// Adapter and preprocessor configs normalized, base source materialized
    ConfigPatched,
    BaseLoaded,
    /// Adapter attached and kept separate from the base
    AdapterAttached,
    /// Adapter folded into the base and discarded
    AdapterMerged,
    ProcessorLoaded,
    /// Inference permitted
    Ready,
}

impl std::fmt::Display for CompositionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::ArtifactsCached => write!(f, "artifacts_cached"),
            Self::ConfigPatched => write!(f, "config_patched"),
            Self::BaseLoaded => write!(f, "base_loaded"),
            Self::AdapterAttached => write!(f, "adapter_attached"),
            Self::AdapterMerged => write!(f, "adapter_merged"),
            Self::ProcessorLoaded => write!(f, "processor_loaded"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// Records the stages one composition passes through.
///
/// Stages only move forward; the adapter stages are the only ones that may
/// be skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTracker {
    model_id: String,
    history: Vec<CompositionStage>,
}

impl StageTracker {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            history: vec![CompositionStage::Uninitialized],
        }
    }

    pub fn current(&self) -> CompositionStage {
        self.history
            .last()
            .copied()
            .unwrap_or(CompositionStage::Uninitialized)
    }

    pub fn advance(&mut self, next: CompositionStage) {
        debug_assert!(next > self.current(), "composition stages only move forward");
        tracing::info!(model_id = %self.model_id, from = %self.current(), to = %next, "Composition stage");
        self.history.push(next);
    }

    pub fn history(&self) -> &[CompositionStage] {
        &self.history
    }

    pub fn into_history(self) -> Vec<CompositionStage> {
        self.history
    }
}
