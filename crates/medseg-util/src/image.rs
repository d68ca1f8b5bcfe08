//! Raster image I/O for grayscale scans, masks and composites.

use std::path::Path;

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use image::{GrayImage, RgbImage};
use thiserror::Error;

/// Extensions accepted when scanning directories for images.
const SUPPORTED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to open image at '{path}': {source}")]
    ImageLoadError {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to save image at '{path}': {source}")]
    ImageSaveError {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("data length mismatch: expected {expected}, got {actual}")]
    DataLengthMismatch { expected: usize, actual: usize },

    #[error("image dimensions {width}x{height} do not fit in u32")]
    DimensionOverflow { width: usize, height: usize },
}

/// Result type alias for [`ImageError`].
pub type ImageResult<T> = Result<T, ImageError>;

/// Loads an image as grayscale with values in `[0, 1]`.
///
/// # Returns
/// Tensor of shape `[1, 1, height, width]`.
pub fn load_grayscale<B: Backend, P: AsRef<Path>>(
    path: P,
    device: &B::Device,
) -> ImageResult<Tensor<B, 4>> {
    let luma = open_luma(path.as_ref())?;
    let (width, height) = luma.dimensions();
    let values: Vec<f32> = luma
        .into_raw()
        .into_iter()
        .map(|v| f32::from(v) / 255.0)
        .collect();

    let data = TensorData::new(values, [1, 1, height as usize, width as usize]);
    Ok(Tensor::from_data(data, device))
}

/// Loads a mask image as a binary label map (non-zero pixels become 1).
///
/// # Returns
/// Tensor of shape `[1, height, width]`.
pub fn load_binary_mask<B: Backend, P: AsRef<Path>>(
    path: P,
    device: &B::Device,
) -> ImageResult<Tensor<B, 3, Int>> {
    let luma = open_luma(path.as_ref())?;
    let (width, height) = luma.dimensions();
    let values: Vec<i64> = luma
        .into_raw()
        .into_iter()
        .map(|v| i64::from(v != 0))
        .collect();

    let data = TensorData::new(values, [1, height as usize, width as usize]);
    Ok(Tensor::from_data(data, device))
}

fn open_luma(path: &Path) -> ImageResult<GrayImage> {
    image::open(path)
        .map(|img| img.into_luma8())
        .map_err(|source| ImageError::ImageLoadError {
            path: path.display().to_string(),
            source,
        })
}

fn dims_u32(width: usize, height: usize) -> ImageResult<(u32, u32)> {
    match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => Ok((w, h)),
        _ => Err(ImageError::DimensionOverflow { width, height }),
    }
}

/// Writes a single-channel 8-bit image. The format follows the extension.
pub fn save_gray<P: AsRef<Path>>(
    path: P,
    width: usize,
    height: usize,
    pixels: Vec<u8>,
) -> ImageResult<()> {
    let (w, h) = dims_u32(width, height)?;
    let actual = pixels.len();
    let buffer = GrayImage::from_raw(w, h, pixels).ok_or(ImageError::DataLengthMismatch {
        expected: width * height,
        actual,
    })?;
    buffer
        .save(path.as_ref())
        .map_err(|source| ImageError::ImageSaveError {
            path: path.as_ref().display().to_string(),
            source,
        })
}

/// Writes an interleaved RGB 8-bit image. The format follows the extension.
pub fn save_rgb<P: AsRef<Path>>(
    path: P,
    width: usize,
    height: usize,
    pixels: Vec<u8>,
) -> ImageResult<()> {
    let (w, h) = dims_u32(width, height)?;
    let actual = pixels.len();
    let buffer = RgbImage::from_raw(w, h, pixels).ok_or(ImageError::DataLengthMismatch {
        expected: width * height * 3,
        actual,
    })?;
    buffer
        .save(path.as_ref())
        .map_err(|source| ImageError::ImageSaveError {
            path: path.as_ref().display().to_string(),
            source,
        })
}

/// Saturating conversion of label values to 8-bit pixels.
pub fn labels_to_pixels(labels: &[i64], scale: i64) -> Vec<u8> {
    labels
        .iter()
        .map(|&v| v.saturating_mul(scale).clamp(0, 255) as u8)
        .collect()
}

/// Check if a file extension is supported for image processing.
pub fn is_extension_supported(extension: &str) -> bool {
    let extension = extension.trim_start_matches('.').to_ascii_lowercase();
    SUPPORTED_EXTENSIONS.contains(&extension.as_str())
}

/// Check if a path points to a supported image format.
pub fn is_supported_image_format<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(is_extension_supported)
}
