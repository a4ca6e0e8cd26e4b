//! Model composition engine
//!
//! Drives one model from an empty cache to a [`ComposedModel`] ready for
//! inference. The async `prepare` half does all file work (download, patch,
//! base materialization); the synchronous `load` half hands the prepared
//! directories to the compute runtime.

use super::adapter::AdapterConfig;
use super::dtype::{Dtype, QuantizationConfig, resolve_dtype};
use super::family::{
    AdapterMode, BaseSourcePlan, CHAT_TEMPLATE_FILE, ModelFamily, VENDOR_BASE_ARCHIVE,
};
use super::patcher::{PREPROCESSOR_CONFIG_FILE, patch_processor_type};
use super::runtime::{
    AdaptedModel, BaseLoadRequest, GenerationParams, LanguageModel, ModelInputs, Processor,
    ProcessorLoadRequest, TensorRuntime,
};
use super::stage::{CompositionStage, StageTracker};
use crate::artifacts::{ArtifactCacheManager, HubClient};
use crate::config::RuntimeConfig;
use crate::descriptor::ModelDescriptor;
use crate::device::Device;
use crate::error::{LmmError, LmmResult};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Key of the template string inside `chat_template.json`
const CHAT_TEMPLATE_KEY: &str = "chat_template";

/// Everything on disk that loading needs, after patching
#[derive(Debug, Clone)]
pub struct PreparedArtifacts {
    /// The model's own cache directory (adapter files, chat template)
    pub model_dir: PathBuf,
    /// Directory the base model and processor load from
    pub base_dir: PathBuf,
    pub base_source: BaseSourcePlan,
    pub adapter: Option<AdapterConfig>,
    pub dtype: Dtype,
    pub quantization: Option<QuantizationConfig>,
    stages: StageTracker,
}

impl PreparedArtifacts {
    pub fn stage(&self) -> CompositionStage {
        self.stages.current()
    }
}

/// Adapter bookkeeping of a composed model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterState {
    None,
    /// Adapter kept alongside the base
    Attached { base_model: String },
    /// Adapter folded into the base weights; no adapter handle remains
    Merged { base_model: String },
}

/// The loaded model: plain base or base with an attached adapter
pub enum ModelHandle {
    Base(Box<dyn LanguageModel>),
    Adapted(Box<dyn AdaptedModel>),
}

impl ModelHandle {
    pub fn device(&self) -> Device {
        match self {
            Self::Base(model) => model.device(),
            Self::Adapted(model) => model.device(),
        }
    }

    pub fn generate(
        &self,
        inputs: &ModelInputs,
        params: &GenerationParams,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        match self {
            Self::Base(model) => model.generate(inputs, params),
            Self::Adapted(model) => model.generate(inputs, params),
        }
    }
}

/// A model ready for inference. Owned by exactly one pipeline.
pub struct ComposedModel {
    model: ModelHandle,
    processor: Box<dyn Processor>,
    adapter: AdapterState,
    dtype: Dtype,
    device: Device,
    stages: Vec<CompositionStage>,
    ready_at: DateTime<Utc>,
}

impl ComposedModel {
    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn processor(&self) -> &dyn Processor {
        self.processor.as_ref()
    }

    pub fn adapter(&self) -> &AdapterState {
        &self.adapter
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Device the model was requested on
    pub fn device(&self) -> Device {
        self.device
    }

    /// Stages passed through, `Uninitialized` first and `Ready` last
    pub fn stages(&self) -> &[CompositionStage] {
        &self.stages
    }

    pub fn stage(&self) -> CompositionStage {
        self.stages
            .last()
            .copied()
            .unwrap_or(CompositionStage::Uninitialized)
    }

    pub fn ready_at(&self) -> DateTime<Utc> {
        self.ready_at
    }
}

impl std::fmt::Debug for ComposedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposedModel")
            .field("adapter", &self.adapter)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("stage", &self.stage())
            .field("ready_at", &self.ready_at)
            .finish_non_exhaustive()
    }
}

/// Composes base models, adapters and processors
pub struct Composer {
    config: Arc<RuntimeConfig>,
    device: Device,
    cache: ArtifactCacheManager,
    hub: Arc<dyn HubClient>,
}

impl Composer {
    /// `device` is resolved once by the caller and reused for every model
    pub fn new(
        config: Arc<RuntimeConfig>,
        device: Device,
        cache: ArtifactCacheManager,
        hub: Arc<dyn HubClient>,
    ) -> Self {
        Self {
            config,
            device,
            cache,
            hub,
        }
    }

    pub fn cache(&self) -> &ArtifactCacheManager {
        &self.cache
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Cache, normalize and materialize everything a family needs on disk
    pub async fn prepare(
        &self,
        descriptor: &ModelDescriptor,
        family: &dyn ModelFamily,
    ) -> LmmResult<PreparedArtifacts> {
        descriptor.validate()?;
        let policy = family.policy();
        let mut stages = StageTracker::new(descriptor.model_id());

        // Fail before downloading anything
        let hub_token = if policy.needs_hub_token() {
            let token = self.config.huggingface_token.clone().ok_or_else(|| {
                LmmError::configuration(format!(
                    "HUGGINGFACE_TOKEN must be set to load a {} model",
                    policy.name
                ))
            })?;
            Some(token)
        } else {
            None
        };

        let model_dir = self
            .cache
            .ensure_model_artifacts(descriptor, &policy.manifest)
            .await?;
        stages.advance(CompositionStage::ArtifactsCached);

        let adapter = if policy.reads_adapter_config {
            Some(AdapterConfig::load(&model_dir)?)
        } else {
            None
        };

        let dtype = resolve_dtype(
            policy.default_dtype,
            descriptor.dtype(),
            adapter.as_ref().and_then(|a| a.revision.as_deref()),
        );

        let base_source = family.resolve_base_source(adapter.as_ref())?;
        let base_dir = match &base_source {
            BaseSourcePlan::OwnCache => model_dir.clone(),
            BaseSourcePlan::Vendor { repo, revision } => {
                self.cache.ensure_vendor_base(repo, revision).await?
            }
            BaseSourcePlan::Hub { repo, revision } => {
                let token = hub_token.as_deref().unwrap_or_default();
                self.hub.snapshot(repo, revision, token).await?
            }
        };

        if policy.purge_vendor_archive {
            purge_file(&base_dir.join(VENDOR_BASE_ARCHIVE)).await?;
        }
        if let Some(expected) = policy.processor_type {
            patch_processor_type(&base_dir.join(PREPROCESSOR_CONFIG_FILE), expected)?;
        }
        stages.advance(CompositionStage::ConfigPatched);

        let quantization = descriptor
            .quantize()
            .unwrap_or(policy.quantize_by_default)
            .then(QuantizationConfig::nf4_double_quant);

        tracing::info!(
            model_id = %descriptor.model_id(),
            revision = ?descriptor.revision(),
            family = policy.name,
            base_dir = ?base_dir,
            dtype = %dtype,
            quantized = quantization.is_some(),
            "Model artifacts prepared"
        );

        Ok(PreparedArtifacts {
            model_dir,
            base_dir,
            base_source,
            adapter,
            dtype,
            quantization,
            stages,
        })
    }

    /// Load base, adapter and processor through the compute runtime.
    ///
    /// Blocks for as long as the runtime takes.
    pub fn load(
        &self,
        prepared: PreparedArtifacts,
        family: &dyn ModelFamily,
        runtime: &dyn TensorRuntime,
    ) -> LmmResult<ComposedModel> {
        let policy = family.policy();
        let PreparedArtifacts {
            model_dir,
            base_dir,
            adapter,
            dtype,
            quantization,
            mut stages,
            ..
        } = prepared;

        let mut base = runtime.load_base(&BaseLoadRequest {
            model_dir: base_dir.clone(),
            device: self.device,
            dtype,
            quantization,
        })?;
        stages.advance(CompositionStage::BaseLoaded);

        let (model, adapter_state) = match (policy.adapter_mode, adapter.as_ref()) {
            (AdapterMode::BaseOnly, _) => {
                base.set_eval(dtype)?;
                (ModelHandle::Base(base), AdapterState::None)
            }
            (AdapterMode::Attach, Some(config)) => {
                let mut adapted = base.attach_adapter(&model_dir, config)?;
                adapted.set_eval(dtype)?;
                stages.advance(CompositionStage::AdapterAttached);
                let base_model = config.base_model()?.to_string();
                (ModelHandle::Adapted(adapted), AdapterState::Attached { base_model })
            }
            (AdapterMode::Merge, Some(config)) => {
                let mut adapted = base.attach_adapter(&model_dir, config)?;
                adapted.set_eval(dtype)?;
                let merged = adapted.merge_and_unload()?;
                stages.advance(CompositionStage::AdapterMerged);
                tracing::info!(scaling = ?config.scaling(), "Merged adapter into base");
                let base_model = config.base_model()?.to_string();
                (ModelHandle::Base(merged), AdapterState::Merged { base_model })
            }
            (_, None) => {
                return Err(LmmError::configuration(format!(
                    "Family {} composes an adapter but read no adapter config",
                    policy.name
                )));
            }
        };

        let chat_template = if policy.uses_chat_template() {
            Some(read_chat_template(&model_dir)?)
        } else {
            None
        };

        let processor = runtime.load_processor(&ProcessorLoadRequest {
            model_dir: base_dir,
            chat_template,
            pixel_bounds: policy.pixel_bounds,
        })?;
        stages.advance(CompositionStage::ProcessorLoaded);
        stages.advance(CompositionStage::Ready);

        Ok(ComposedModel {
            model,
            processor,
            adapter: adapter_state,
            dtype,
            device: self.device,
            stages: stages.into_history(),
            ready_at: Utc::now(),
        })
    }

    /// `prepare` followed by `load`
    pub async fn compose(
        &self,
        descriptor: &ModelDescriptor,
        family: &dyn ModelFamily,
        runtime: &dyn TensorRuntime,
    ) -> LmmResult<ComposedModel> {
        let started = Instant::now();
        let prepared = self.prepare(descriptor, family).await?;
        let composed = self.load(prepared, family, runtime)?;

        let elapsed = started.elapsed();
        metrics::record_composition(family.policy().name, elapsed.as_secs_f64());
        tracing::info!(
            model_id = %descriptor.model_id(),
            family = family.policy().name,
            duration_ms = elapsed.as_millis() as u64,
            "Model ready"
        );
        Ok(composed)
    }
}

/// Read the `chat_template` string from `chat_template.json` in `dir`
pub fn read_chat_template(dir: &Path) -> LmmResult<String> {
    let path = dir.join(CHAT_TEMPLATE_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LmmError::artifact(format!(
                "Chat template not found at {:?}",
                path
            )));
        }
        Err(e) => return Err(LmmError::io(&path, e)),
    };

    let value: serde_json::Value = serde_json::from_str(&content)?;
    value
        .get(CHAT_TEMPLATE_KEY)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            LmmError::configuration(format!("'{}' not found in {:?}", CHAT_TEMPLATE_KEY, path))
        })
}

/// Remove a file if present
async fn purge_file(path: &Path) -> LmmResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = ?path, "Removed cached archive");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LmmError::io(path, e)),
    }
}
