//! Compute and tokenization collaborators
//!
//! The composition engine never touches tensors itself. It drives these
//! traits, which the embedding application implements on top of its tensor
//! library. All calls are synchronous and may block.

use super::adapter::AdapterConfig;
use super::dtype::{Dtype, QuantizationConfig};
use crate::device::Device;
use crate::error::{LmmError, LmmResult};
use crate::inference::conversation::Conversation;
use image::RgbImage;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ============================================================================
// Trait Definitions
// ============================================================================

/// Loads base models and processors from a directory of artifacts
pub trait TensorRuntime: Send + Sync {
    fn load_base(&self, request: &BaseLoadRequest) -> anyhow::Result<Box<dyn LanguageModel>>;

    fn load_processor(&self, request: &ProcessorLoadRequest) -> anyhow::Result<Box<dyn Processor>>;
}

/// A loaded generative model without an attached adapter
pub trait LanguageModel: Send {
    /// Device holding the weights; inputs are moved here before generation
    fn device(&self) -> Device;

    /// Switch to inference mode at the given precision
    fn set_eval(&mut self, dtype: Dtype) -> anyhow::Result<()>;

    /// Wrap this model with the adapter stored in `adapter_dir`
    fn attach_adapter(
        self: Box<Self>,
        adapter_dir: &Path,
        config: &AdapterConfig,
    ) -> anyhow::Result<Box<dyn AdaptedModel>>;

    /// Generate continuations; one token sequence per batch row
    fn generate(
        &self,
        inputs: &ModelInputs,
        params: &GenerationParams,
    ) -> anyhow::Result<Vec<Vec<u32>>>;
}

/// A base model with an adapter attached but not merged
pub trait AdaptedModel: Send {
    fn device(&self) -> Device;

    fn set_eval(&mut self, dtype: Dtype) -> anyhow::Result<()>;

    /// Fold the adapter weights into the base and drop the adapter.
    /// Consumes the adapted model, so the adapter cannot be reached again.
    fn merge_and_unload(self: Box<Self>) -> anyhow::Result<Box<dyn LanguageModel>>;

    fn generate(
        &self,
        inputs: &ModelInputs,
        params: &GenerationParams,
    ) -> anyhow::Result<Vec<Vec<u32>>>;
}

/// Tokenizer, image preprocessor and chat template
pub trait Processor: Send {
    fn apply_chat_template(&self, conversation: &Conversation) -> anyhow::Result<String>;

    /// Encode text and image jointly
    fn encode(&self, text: &str, image: &RgbImage) -> anyhow::Result<EncodedInputs>;

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> anyhow::Result<String>;

    fn special_tokens(&self) -> SpecialTokenIds;
}

// ============================================================================
// Requests and Parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BaseLoadRequest {
    pub model_dir: PathBuf,
    pub device: Device,
    pub dtype: Dtype,
    /// `Some` loads the base quantized
    pub quantization: Option<QuantizationConfig>,
}

/// Image resolution bounds, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBounds {
    pub min_pixels: u32,
    pub max_pixels: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorLoadRequest {
    pub model_dir: PathBuf,
    pub chat_template: Option<String>,
    pub pixel_bounds: Option<PixelBounds>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialTokenIds {
    pub pad: Option<u32>,
    pub eos: Option<u32>,
    pub bos: Option<u32>,
}

/// Decoding settings for one generate call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    /// 0 disables the repetition window
    pub no_repeat_ngram_size: usize,
    pub special_tokens: SpecialTokenIds,
}

impl GenerationParams {
    /// Greedy decoding with the given token budget
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            do_sample: false,
            no_repeat_ngram_size: 0,
            special_tokens: SpecialTokenIds::default(),
        }
    }

    pub fn with_special_tokens(mut self, special_tokens: SpecialTokenIds) -> Self {
        self.special_tokens = special_tokens;
        self
    }
}

// ============================================================================
// Encoded Inputs
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Int(Vec<i64>),
    Float(Vec<f32>),
}

/// Dense tensor as produced by the processor
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
    pub device: Device,
}

impl Tensor {
    pub fn int(shape: Vec<usize>, values: Vec<i64>) -> Self {
        Self {
            shape,
            data: TensorData::Int(values),
            device: Device::Cpu,
        }
    }

    pub fn float(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self {
            shape,
            data: TensorData::Float(values),
            device: Device::Cpu,
        }
    }

    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncodedValue {
    Tensor(Tensor),
    /// Metadata the processor emits alongside tensors (sizes, flags)
    Other(Value),
}

/// Processor output keyed by field name (`input_ids`, `pixel_values`, ...)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedInputs {
    fields: BTreeMap<String, EncodedValue>,
}

impl EncodedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: EncodedValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn with_tensor(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, EncodedValue::Tensor(tensor));
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, EncodedValue::Other(value));
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Move tensors to `device` and drop every non-tensor field
    pub fn to_device(self, device: Device) -> ModelInputs {
        let tensors = self
            .fields
            .into_iter()
            .filter_map(|(name, value)| match value {
                EncodedValue::Tensor(tensor) => Some((name, tensor.to_device(device))),
                EncodedValue::Other(_) => {
                    tracing::trace!(field = %name, "Dropping non-tensor input field");
                    None
                }
            })
            .collect();
        ModelInputs { tensors }
    }
}

pub const INPUT_IDS: &str = "input_ids";

/// Device-resident model inputs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelInputs {
    tensors: BTreeMap<String, Tensor>,
}

impl ModelInputs {
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Length of the encoded prompt (last dimension of `input_ids`)
    pub fn input_len(&self) -> LmmResult<usize> {
        self.tensors
            .get(INPUT_IDS)
            .and_then(|t| t.shape.last().copied())
            .ok_or_else(|| LmmError::Inference("Encoded inputs carry no input_ids".to_string()))
    }
}
