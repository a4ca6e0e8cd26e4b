//! Configuration patching and model composition

pub mod adapter;
pub mod dtype;
pub mod engine;
pub mod family;
pub mod patcher;
pub mod runtime;
pub mod stage;

pub use adapter::{AdapterConfig, TargetModules};
pub use dtype::{Dtype, QuantType, QuantizationConfig};
pub use engine::{AdapterState, ComposedModel, Composer, ModelHandle, PreparedArtifacts};
pub use family::{FamilyKind, FamilyPolicy, ModelFamily};
pub use runtime::{AdaptedModel, LanguageModel, Processor, TensorRuntime};
pub use stage::CompositionStage;
