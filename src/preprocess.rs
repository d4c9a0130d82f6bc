//! Decoding of uploaded bytes and conversion to the BLIP vision input.

use candle_core::{DType, Device, Tensor};
use image::{ImageFormat, RgbImage, imageops::FilterType};

/// Side of the square image fed to the vision encoder.
pub const IMAGE_SIZE: u32 = 384;

/// Default cap on the size of an uploaded image (10MB).
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

// CLIP normalization constants used by the BLIP processor
const MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("Image data is empty")]
    Empty,

    #[error("Image data is too large: {0} bytes (max: {1} bytes)")]
    TooLarge(usize, usize),

    #[error("Unsupported image format")]
    UnsupportedFormat,

    #[error("Failed to decode image: {0}")]
    Decode(String),
}

/// Information about an uploaded image, gathered while decoding it.
#[derive(Clone, Debug)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub size_bytes: usize,
}

/// Decode raw image bytes into an rgb8 image.
///
/// The format is guessed from the content, not from the file name. Images with
/// an alpha channel or a single channel are converted to RGB.
pub fn decode_image(bytes: &[u8], max_bytes: usize) -> Result<(RgbImage, ImageInfo), DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    if bytes.len() > max_bytes {
        return Err(DecodeError::TooLarge(bytes.len(), max_bytes));
    }

    let format = image::guess_format(bytes).map_err(|_| DecodeError::UnsupportedFormat)?;

    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| DecodeError::Decode(e.to_string()))?
        .to_rgb8();

    let info = ImageInfo {
        width: image.width(),
        height: image.height(),
        format,
        size_bytes: bytes.len(),
    };

    Ok((image, info))
}

/// Convert an rgb8 image to a normalized tensor with shape [3, 384, 384].
///
/// The image is resized (bicubic, aspect ratio not preserved), scaled to
/// [0, 1] and normalized with the CLIP mean and std.
pub fn image_to_tensor(image: &RgbImage, device: &Device) -> candle_core::Result<Tensor> {
    let resized = image::imageops::resize(image, IMAGE_SIZE, IMAGE_SIZE, FilterType::CatmullRom);
    let side = IMAGE_SIZE as usize;

    let pixels = Tensor::from_vec(resized.into_raw(), (side, side, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?;

    let mean = Tensor::new(&MEAN, device)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&STD, device)?.reshape((3, 1, 1))?;

    pixels.broadcast_sub(&mean)?.broadcast_div(&std)
}
