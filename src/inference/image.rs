//! Request image decoding

use crate::error::{LmmError, LmmResult};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Image as supplied by the caller
#[derive(Debug, Clone)]
pub enum ImageInput {
    Path(PathBuf),
    /// Encoded bytes in any format the decoder recognizes
    Bytes(Vec<u8>),
    Rgb(RgbImage),
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
}

impl ImageDims {
    pub fn of(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self { width, height }
    }
}

pub trait ImageLoader: Send + Sync {
    /// Decode any supported input into an 8-bit RGB image
    fn load_image_as_rgb(&self, input: &ImageInput) -> LmmResult<RgbImage>;
}

/// Decodes with the `image` crate, converting every color type to RGB8
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodingImageLoader;

impl ImageLoader for DecodingImageLoader {
    fn load_image_as_rgb(&self, input: &ImageInput) -> LmmResult<RgbImage> {
        let image = match input {
            ImageInput::Rgb(rgb) => return Ok(rgb.clone()),
            ImageInput::Path(path) => image::open(path)?,
            ImageInput::Bytes(bytes) => image::load_from_memory(bytes)?,
        };

        let rgb = image.to_rgb8();
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(LmmError::Inference("Image has zero area".to_string()));
        }
        Ok(rgb)
    }
}
