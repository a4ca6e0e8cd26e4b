//! lmm-compose - multimodal model artifact cache and LoRA composition
//!
//! Resolves and caches the files a vision-language model needs, normalizes
//! adapter and preprocessor configs on disk, composes a base model with an
//! optional LoRA adapter through a pluggable compute runtime, and drives
//! single-turn image + text generation.

pub mod artifacts;
pub mod compose;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod inference;
pub mod metrics;

pub use artifacts::{ArtifactCacheManager, ArtifactStore, HubClient, ModelApi};
pub use compose::{ComposedModel, Composer, CompositionStage, Dtype, FamilyKind, ModelFamily};
pub use config::RuntimeConfig;
pub use descriptor::ModelDescriptor;
pub use device::Device;
pub use error::{LmmError, LmmResult};
pub use inference::{Collaborators, ImageInput, LmmInferenceResponse, LmmModel};
