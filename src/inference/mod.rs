//! Single-turn image + text inference

pub mod conversation;
pub mod image;
pub mod pipeline;

pub use conversation::{Conversation, split_prompt};
pub use image::{DecodingImageLoader, ImageDims, ImageInput, ImageLoader};
pub use pipeline::{Collaborators, InferenceResponseImage, LmmInferenceResponse, LmmModel};
