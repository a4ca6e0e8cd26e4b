//! Inference pipeline: image + prompt in, sanitized text out

use super::image::{DecodingImageLoader, ImageDims, ImageInput, ImageLoader};
use crate::artifacts::{
    ArtifactCacheManager, ArtifactStore, FsArtifactStore, HfHubClient, HttpModelApi, HubClient,
    ModelApi,
};
use crate::compose::family::{ModelFamily, PromptInput};
use crate::compose::runtime::GenerationParams;
use crate::compose::{ComposedModel, Composer, TensorRuntime};
use crate::config::RuntimeConfig;
use crate::descriptor::ModelDescriptor;
use crate::device::Device;
use crate::error::{LmmError, LmmResult};
use crate::metrics;
use ::image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResponseImage {
    pub width: u32,
    pub height: u32,
}

/// Response of one inference call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmmInferenceResponse {
    pub response: String,
    pub image: InferenceResponseImage,
}

/// External services a model instance is built from
#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn ModelApi>,
    pub store: Arc<dyn ArtifactStore>,
    pub hub: Arc<dyn HubClient>,
    pub runtime: Arc<dyn TensorRuntime>,
    pub image_loader: Arc<dyn ImageLoader>,
}

impl Collaborators {
    /// HTTP API, filesystem cache, hf-hub and `image` decoding around the
    /// given compute runtime
    pub fn production(config: &RuntimeConfig, runtime: Arc<dyn TensorRuntime>) -> LmmResult<Self> {
        Ok(Self {
            api: Arc::new(HttpModelApi::new(config)?),
            store: Arc::new(FsArtifactStore::new(&config.cache_dir)),
            hub: Arc::new(HfHubClient::new(config.hub_cache_dir())),
            runtime,
            image_loader: Arc::new(DecodingImageLoader),
        })
    }
}

/// A composed model serving single-turn requests
pub struct LmmModel {
    descriptor: ModelDescriptor,
    family: Arc<dyn ModelFamily>,
    composed: ComposedModel,
    image_loader: Arc<dyn ImageLoader>,
}

impl LmmModel {
    /// Run the whole cache and composition pipeline.
    ///
    /// Resolves to a ready model or a fatal error; no partially loaded
    /// instance is ever returned.
    pub async fn load(
        config: Arc<RuntimeConfig>,
        device: Device,
        descriptor: ModelDescriptor,
        family: Arc<dyn ModelFamily>,
        collaborators: &Collaborators,
    ) -> LmmResult<Self> {
        let cache = ArtifactCacheManager::new(
            collaborators.api.clone(),
            collaborators.store.clone(),
            &config,
        );
        let composer = Composer::new(config, device, cache, collaborators.hub.clone());
        let composed = composer
            .compose(&descriptor, family.as_ref(), collaborators.runtime.as_ref())
            .await?;

        Ok(Self::from_composed(
            descriptor,
            family,
            composed,
            collaborators.image_loader.clone(),
        ))
    }

    pub fn from_composed(
        descriptor: ModelDescriptor,
        family: Arc<dyn ModelFamily>,
        composed: ComposedModel,
        image_loader: Arc<dyn ImageLoader>,
    ) -> Self {
        Self {
            descriptor,
            family,
            composed,
            image_loader,
        }
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn family(&self) -> &dyn ModelFamily {
        self.family.as_ref()
    }

    pub fn composed(&self) -> &ComposedModel {
        &self.composed
    }

    /// Decode the request image and record its dimensions
    pub fn preprocess(&self, input: &ImageInput) -> LmmResult<(RgbImage, ImageDims)> {
        let image = self.image_loader.load_image_as_rgb(input)?;
        let dims = ImageDims::of(&image);
        Ok((image, dims))
    }

    /// Generate a response for one image and an optional prompt.
    ///
    /// Blocks for the duration of generation.
    pub fn predict(&self, image: &RgbImage, prompt: Option<&str>) -> LmmResult<String> {
        let policy = self.family.policy();
        let processor = self.composed.processor();

        let text = match self.family.build_prompt(prompt, ImageDims::of(image)) {
            PromptInput::Raw(text) => text,
            PromptInput::Chat(conversation) => processor.apply_chat_template(&conversation)?,
        };

        let inputs = processor
            .encode(&text, image)?
            .to_device(self.composed.model().device());
        let input_len = inputs.input_len()?;

        let mut params = GenerationParams::greedy(policy.max_new_tokens);
        if policy.pass_special_token_ids {
            params = params.with_special_tokens(processor.special_tokens());
        }

        let sequence = self
            .composed
            .model()
            .generate(&inputs, &params)?
            .into_iter()
            .next()
            .ok_or_else(|| LmmError::Inference("Generation returned no sequences".to_string()))?;

        // Whether the prompt is echoed back is family specific; count what is decoded
        let tokens = policy.output_slicing.apply(&sequence, input_len);
        metrics::record_generation(policy.name, tokens.len());
        tracing::debug!(
            model_id = %self.descriptor.model_id(),
            input_len,
            sequence_len = sequence.len(),
            decoded_len = tokens.len(),
            "Generation finished"
        );

        let decoded = processor.decode(tokens, policy.skip_special_tokens)?;
        Ok(self.family.sanitize_output(decoded))
    }

    pub fn postprocess(&self, text: String, dims: ImageDims) -> LmmInferenceResponse {
        LmmInferenceResponse {
            response: text,
            image: InferenceResponseImage {
                width: dims.width,
                height: dims.height,
            },
        }
    }

    /// `preprocess`, `predict` and `postprocess` in sequence
    pub fn infer(&self, input: &ImageInput, prompt: Option<&str>) -> LmmResult<LmmInferenceResponse> {
        let (image, dims) = self.preprocess(input)?;
        let text = self.predict(&image, prompt)?;
        Ok(self.postprocess(text, dims))
    }
}
