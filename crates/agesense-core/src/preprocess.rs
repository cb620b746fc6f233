//! Frame preprocessing for the age/gender model.
//!
//! Center-crops the frame to a square, resizes it to 224×224 and writes an
//! ImageNet-normalized NCHW tensor.

use crate::tensor::{InputTensor, INPUT_SIZE};
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

// --- ImageNet normalization constants (per RGB channel) ---
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("frame has no pixels ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
}

/// Knobs for [`preprocess`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PreprocessOptions {
    /// Flip the crop horizontally (selfie view).
    pub mirror: bool,
}

/// Crop the largest centered square out of `frame` and resize it to the
/// model's 224×224 input.
///
/// This is the exact image that [`preprocess`] normalizes; callers can save
/// it to inspect what the model saw.
pub fn preview_image(frame: &RgbImage, options: &PreprocessOptions) -> Result<RgbImage, PreprocessError> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Err(PreprocessError::EmptyFrame { width, height });
    }

    let side = width.min(height);
    let x = (width - side) / 2;
    let y = (height - side) / 2;

    let crop = imageops::crop_imm(frame, x, y, side, side).to_image();
    let size = INPUT_SIZE as u32;
    let resized = imageops::resize(&crop, size, size, FilterType::Triangle);

    Ok(if options.mirror {
        imageops::flip_horizontal(&resized)
    } else {
        resized
    })
}

/// Convert an RGB frame into the `[1, 3, 224, 224]` model input.
///
/// Pure and deterministic: the same frame always yields a bit-identical
/// tensor, whatever its aspect ratio.
pub fn preprocess(frame: &RgbImage, options: &PreprocessOptions) -> Result<InputTensor, PreprocessError> {
    let square = preview_image(frame, options)?;
    Ok(normalize(&square))
}

/// Channel-planar ImageNet normalization of a 224×224 RGB image.
fn normalize(square: &RgbImage) -> InputTensor {
    let mut tensor = InputTensor::zeros();
    let mut view = tensor.view_mut();

    for (x, y, pixel) in square.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let sample = pixel[c] as f32 / 255.0;
            view[[0, c, y, x]] = (sample - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    tensor
}
