//! Model families
//!
//! Every family runs through the same composition pipeline. What differs is
//! captured as data in a [`FamilyPolicy`], plus the three capabilities of
//! the [`ModelFamily`] trait.

use super::adapter::AdapterConfig;
use super::dtype::Dtype;
use super::patcher::{ADAPTER_CONFIG_FILE, PREPROCESSOR_CONFIG_FILE};
use super::runtime::PixelBounds;
use crate::artifacts::{FileManifest, RequiredFile};
use crate::error::{LmmError, LmmResult};
use crate::inference::conversation::Conversation;
use crate::inference::image::ImageDims;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const CHAT_TEMPLATE_FILE: &str = "chat_template.json";

/// Image processor class the Qwen2.5-VL loader recognizes
pub const QWEN_IMAGE_PROCESSOR: &str = "Qwen2VLImageProcessor";

pub const QWEN_SYSTEM_PROMPT: &str =
    "You are a Qwen2.5-VL model that can answer questions about any image.";

/// Role and tokenizer artifacts the Qwen2.5-VL decoder leaves in its output
pub const QWEN_OUTPUT_ARTIFACTS: [&str; 2] = ["assistant\n", " addCriterion\n"];

/// Archive a vendor base is shipped as
pub const VENDOR_BASE_ARCHIVE: &str = "weights.tar.gz";

const QWEN_PATCH_PIXELS: u32 = 28 * 28;

// ============================================================================
// Policy
// ============================================================================

/// Which part of the generated sequence is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSlicing {
    /// Decode the whole sequence, prompt included
    KeepAll,
    /// Drop the first `input_len` tokens
    StripInputPrefix,
}

impl OutputSlicing {
    pub fn apply(self, sequence: &[u32], input_len: usize) -> &[u32] {
        match self {
            Self::KeepAll => sequence,
            Self::StripInputPrefix => sequence.get(input_len..).unwrap_or(&[]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterMode {
    /// No adapter is attached
    BaseOnly,
    /// Attach the adapter and keep it separate
    Attach,
    /// Attach, merge into the base and discard the adapter
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseSourceKind {
    /// Base weights live in the model's own cache directory
    OwnCache,
    /// Vendor-hosted archive cached under `lora-bases/`
    Vendor,
    /// Public hub repository; requires an access token
    Hub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    /// The caller's prompt goes to the processor as-is
    Raw,
    /// System and user turns rendered through the chat template
    Chat,
}

/// Data-driven per-family behavior
#[derive(Debug, Clone)]
pub struct FamilyPolicy {
    pub name: &'static str,
    pub default_dtype: Dtype,
    pub quantize_by_default: bool,
    pub adapter_mode: AdapterMode,
    /// Whether `adapter_config.json` is read (for the base reference)
    pub reads_adapter_config: bool,
    pub base_source: BaseSourceKind,
    pub prompt_style: PromptStyle,
    pub default_system_prompt: &'static str,
    pub max_new_tokens: usize,
    pub output_slicing: OutputSlicing,
    pub skip_special_tokens: bool,
    /// Hand the processor's pad/eos/bos ids to generation
    pub pass_special_token_ids: bool,
    /// Expected `image_processor_type` in the base preprocessor config
    pub processor_type: Option<&'static str>,
    pub pixel_bounds: Option<PixelBounds>,
    /// Remove the vendor base archive once extracted
    pub purge_vendor_archive: bool,
    pub manifest: FileManifest,
}

impl FamilyPolicy {
    pub fn needs_hub_token(&self) -> bool {
        self.base_source == BaseSourceKind::Hub
    }

    pub fn uses_chat_template(&self) -> bool {
        self.prompt_style == PromptStyle::Chat
    }
}

fn optional_companions() -> Vec<String> {
    ["special_tokens_map.json", "tokenizer_config.json", "generation_config.json"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Full-weight model: config, tokenizer, safetensors shards, preprocessor
fn plain_manifest() -> LmmResult<FileManifest> {
    Ok(FileManifest {
        required: vec![
            RequiredFile::exact("config.json"),
            RequiredFile::exact("tokenizer.json"),
            RequiredFile::pattern(r"model.*\.safetensors")?,
            RequiredFile::exact(PREPROCESSOR_CONFIG_FILE),
        ],
        optional: optional_companions(),
    })
}

fn adapter_manifest() -> FileManifest {
    FileManifest {
        required: vec![
            RequiredFile::exact(ADAPTER_CONFIG_FILE),
            RequiredFile::exact("adapter_model.safetensors"),
            RequiredFile::exact("tokenizer.json"),
            RequiredFile::exact(PREPROCESSOR_CONFIG_FILE),
        ],
        optional: optional_companions(),
    }
}

/// Vendor-based Qwen2.5-VL without adapter weights: the adapter config only
/// names the base
fn qwen_base_manifest() -> FileManifest {
    FileManifest {
        required: vec![
            RequiredFile::exact(ADAPTER_CONFIG_FILE),
            RequiredFile::exact("tokenizer.json"),
            RequiredFile::exact(PREPROCESSOR_CONFIG_FILE),
            RequiredFile::exact(CHAT_TEMPLATE_FILE),
        ],
        optional: optional_companions(),
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Where the base model comes from, resolved against the adapter config
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseSourcePlan {
    OwnCache,
    Vendor { repo: String, revision: String },
    Hub { repo: String, revision: String },
}

/// What the processor receives as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    Raw(String),
    Chat(Conversation),
}

pub trait ModelFamily: Send + Sync {
    fn policy(&self) -> &FamilyPolicy;

    fn resolve_base_source(&self, adapter: Option<&AdapterConfig>) -> LmmResult<BaseSourcePlan> {
        let kind = self.policy().base_source;
        if kind == BaseSourceKind::OwnCache {
            return Ok(BaseSourcePlan::OwnCache);
        }

        let adapter = adapter.ok_or_else(|| {
            LmmError::configuration(format!(
                "Family {} needs {} to locate its base model",
                self.policy().name,
                ADAPTER_CONFIG_FILE
            ))
        })?;
        let repo = adapter.base_model()?.to_string();
        let revision = adapter.base_revision().to_string();

        Ok(match kind {
            BaseSourceKind::Hub => BaseSourcePlan::Hub { repo, revision },
            _ => BaseSourcePlan::Vendor { repo, revision },
        })
    }

    fn build_prompt(&self, prompt: Option<&str>, image: ImageDims) -> PromptInput {
        let policy = self.policy();
        match policy.prompt_style {
            PromptStyle::Raw => PromptInput::Raw(prompt.unwrap_or_default().to_string()),
            PromptStyle::Chat => PromptInput::Chat(Conversation::from_prompt(
                prompt,
                policy.default_system_prompt,
                image,
            )),
        }
    }

    fn sanitize_output(&self, decoded: String) -> String {
        decoded
    }
}

fn strip_qwen_artifacts(decoded: String) -> String {
    QWEN_OUTPUT_ARTIFACTS
        .iter()
        .fold(decoded, |text, artifact| text.replace(artifact, ""))
}

// ============================================================================
// Families
// ============================================================================

/// Full-weight vision-language model served from its own cache
pub struct TransformersFamily {
    policy: FamilyPolicy,
}

impl TransformersFamily {
    pub fn new() -> LmmResult<Self> {
        Ok(Self {
            policy: FamilyPolicy {
                name: "transformers",
                default_dtype: Dtype::Float16,
                quantize_by_default: false,
                adapter_mode: AdapterMode::BaseOnly,
                reads_adapter_config: false,
                base_source: BaseSourceKind::OwnCache,
                prompt_style: PromptStyle::Raw,
                default_system_prompt: "",
                max_new_tokens: 1000,
                output_slicing: OutputSlicing::KeepAll,
                skip_special_tokens: true,
                pass_special_token_ids: false,
                processor_type: None,
                pixel_bounds: None,
                purge_vendor_archive: false,
                manifest: plain_manifest()?,
            },
        })
    }
}

impl ModelFamily for TransformersFamily {
    fn policy(&self) -> &FamilyPolicy {
        &self.policy
    }
}

/// LoRA adapter over a gated hub base, merged on load
pub struct LoraTransformersFamily {
    policy: FamilyPolicy,
}

impl LoraTransformersFamily {
    pub fn new() -> Self {
        Self {
            policy: FamilyPolicy {
                name: "lora-transformers",
                default_dtype: Dtype::Float16,
                quantize_by_default: false,
                adapter_mode: AdapterMode::Merge,
                reads_adapter_config: true,
                base_source: BaseSourceKind::Hub,
                prompt_style: PromptStyle::Raw,
                default_system_prompt: "",
                max_new_tokens: 1000,
                output_slicing: OutputSlicing::KeepAll,
                skip_special_tokens: true,
                pass_special_token_ids: false,
                processor_type: None,
                pixel_bounds: None,
                purge_vendor_archive: false,
                manifest: adapter_manifest(),
            },
        }
    }
}

impl Default for LoraTransformersFamily {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelFamily for LoraTransformersFamily {
    fn policy(&self) -> &FamilyPolicy {
        &self.policy
    }
}

/// Qwen2.5-VL on a vendor base, quantized, chat-templated
pub struct Qwen25VlFamily {
    policy: FamilyPolicy,
}

impl Qwen25VlFamily {
    pub fn new() -> Self {
        Self {
            policy: FamilyPolicy {
                name: "qwen25vl",
                default_dtype: Dtype::BFloat16,
                quantize_by_default: true,
                adapter_mode: AdapterMode::BaseOnly,
                reads_adapter_config: true,
                base_source: BaseSourceKind::Vendor,
                prompt_style: PromptStyle::Chat,
                default_system_prompt: QWEN_SYSTEM_PROMPT,
                max_new_tokens: 512,
                // The decoder output already excludes the prompt here
                output_slicing: OutputSlicing::KeepAll,
                skip_special_tokens: false,
                pass_special_token_ids: true,
                processor_type: Some(QWEN_IMAGE_PROCESSOR),
                pixel_bounds: None,
                purge_vendor_archive: false,
                manifest: qwen_base_manifest(),
            },
        }
    }
}

impl Default for Qwen25VlFamily {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelFamily for Qwen25VlFamily {
    fn policy(&self) -> &FamilyPolicy {
        &self.policy
    }

    fn sanitize_output(&self, decoded: String) -> String {
        strip_qwen_artifacts(decoded)
    }
}

/// Qwen2.5-VL LoRA adapter on a vendor base, merged on load
pub struct LoraQwen25VlFamily {
    policy: FamilyPolicy,
}

impl LoraQwen25VlFamily {
    pub fn new() -> Self {
        let mut manifest = adapter_manifest();
        manifest.required.push(RequiredFile::exact(CHAT_TEMPLATE_FILE));

        Self {
            policy: FamilyPolicy {
                name: "lora-qwen25vl",
                default_dtype: Dtype::BFloat16,
                quantize_by_default: true,
                adapter_mode: AdapterMode::Merge,
                reads_adapter_config: true,
                base_source: BaseSourceKind::Vendor,
                prompt_style: PromptStyle::Chat,
                default_system_prompt: QWEN_SYSTEM_PROMPT,
                max_new_tokens: 512,
                output_slicing: OutputSlicing::StripInputPrefix,
                skip_special_tokens: true,
                pass_special_token_ids: true,
                processor_type: Some(QWEN_IMAGE_PROCESSOR),
                pixel_bounds: Some(PixelBounds {
                    min_pixels: 256 * QWEN_PATCH_PIXELS,
                    max_pixels: 1280 * QWEN_PATCH_PIXELS,
                }),
                purge_vendor_archive: true,
                manifest,
            },
        }
    }
}

impl Default for LoraQwen25VlFamily {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelFamily for LoraQwen25VlFamily {
    fn policy(&self) -> &FamilyPolicy {
        &self.policy
    }

    fn sanitize_output(&self, decoded: String) -> String {
        strip_qwen_artifacts(decoded)
    }
}

// ============================================================================
// Family Selection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FamilyKind {
    Transformers,
    LoraTransformers,
    Qwen25Vl,
    LoraQwen25Vl,
}

impl FamilyKind {
    pub const ALL: [FamilyKind; 4] = [
        Self::Transformers,
        Self::LoraTransformers,
        Self::Qwen25Vl,
        Self::LoraQwen25Vl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transformers => "transformers",
            Self::LoraTransformers => "lora-transformers",
            Self::Qwen25Vl => "qwen25vl",
            Self::LoraQwen25Vl => "lora-qwen25vl",
        }
    }

    pub fn build(self) -> LmmResult<Arc<dyn ModelFamily>> {
        Ok(match self {
            Self::Transformers => Arc::new(TransformersFamily::new()?),
            Self::LoraTransformers => Arc::new(LoraTransformersFamily::new()),
            Self::Qwen25Vl => Arc::new(Qwen25VlFamily::new()),
            Self::LoraQwen25Vl => Arc::new(LoraQwen25VlFamily::new()),
        })
    }
}

impl fmt::Display for FamilyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FamilyKind {
    type Err = LmmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
                LmmError::configuration(format!(
                    "Unknown model family '{}', expected one of: {}",
                    s,
                    known.join(", ")
                ))
            })
    }
}
