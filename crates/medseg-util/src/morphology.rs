//! Morphological cleanup of predicted label maps.
//!
//! Erosion and dilation are flat min/max filters over a rectangular
//! structuring element. Pixels outside the image never take part in the
//! window, so the image border neither erodes nor grows a mask. On binary
//! masks this is the classic binary morphology; on masks scaled to 0/255 the
//! scale is preserved.

use burn::tensor::{backend::Backend, Int, Tensor};
use thiserror::Error;

use crate::label::LabelMaps;

/// Side length of the square structuring element used by default.
pub const DEFAULT_KERNEL_SIZE: usize = 7;

#[derive(Debug, Error)]
pub enum MorphologyError {
    #[error("structuring element size must be at least 1, got {size}")]
    InvalidKernelSize { size: usize },

    #[error("plane has {actual} values, expected {width}x{height}")]
    DimensionMismatch {
        width: usize,
        height: usize,
        actual: usize,
    },
}

/// Flat rectangular structuring element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuringElement {
    height: usize,
    width: usize,
    /// Anchor point `(row, col)` inside the element.
    anchor: (usize, usize),
}

impl StructuringElement {
    /// Rectangle with its anchor at the center (`size / 2`).
    ///
    /// # Errors
    ///
    /// Returns [`MorphologyError::InvalidKernelSize`] for a zero dimension.
    pub fn rectangle(height: usize, width: usize) -> Result<Self, MorphologyError> {
        if height == 0 || width == 0 {
            return Err(MorphologyError::InvalidKernelSize {
                size: height.min(width),
            });
        }
        Ok(Self {
            height,
            width,
            anchor: (height / 2, width / 2),
        })
    }

    /// All-ones `size x size` element.
    ///
    /// # Errors
    ///
    /// Returns [`MorphologyError::InvalidKernelSize`] when `size == 0`.
    pub fn square(size: usize) -> Result<Self, MorphologyError> {
        Self::rectangle(size, size)
    }

    pub const fn dims(&self) -> [usize; 2] {
        [self.height, self.width]
    }

    pub const fn is_identity(&self) -> bool {
        self.height == 1 && self.width == 1
    }
}

impl Default for StructuringElement {
    fn default() -> Self {
        Self {
            height: DEFAULT_KERNEL_SIZE,
            width: DEFAULT_KERNEL_SIZE,
            anchor: (DEFAULT_KERNEL_SIZE / 2, DEFAULT_KERNEL_SIZE / 2),
        }
    }
}

/// A single 2D plane of integer values, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    width: usize,
    height: usize,
    values: Vec<i64>,
}

impl Plane {
    /// # Errors
    ///
    /// Returns [`MorphologyError::DimensionMismatch`] when `values` does not
    /// hold `width * height` entries.
    pub fn new(width: usize, height: usize, values: Vec<i64>) -> Result<Self, MorphologyError> {
        if values.len() != width * height {
            return Err(MorphologyError::DimensionMismatch {
                width,
                height,
                actual: values.len(),
            });
        }
        Ok(Self {
            width,
            height,
            values,
        })
    }

    pub const fn width(&self) -> usize {
        self.width
    }

    pub const fn height(&self) -> usize {
        self.height
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    pub fn into_values(self) -> Vec<i64> {
        self.values
    }

    pub fn get(&self, row: usize, col: usize) -> i64 {
        self.values[row * self.width + col]
    }
}

#[derive(Clone, Copy)]
enum Extremum {
    Min,
    Max,
}

impl Extremum {
    fn pick(self, a: i64, b: i64) -> i64 {
        match self {
            Self::Min => a.min(b),
            Self::Max => a.max(b),
        }
    }
}

/// Window of a 1D filter at `index`, clipped to `[0, len)`.
fn window(index: usize, len: usize, size: usize, anchor: usize) -> core::ops::Range<usize> {
    let start = index.saturating_sub(anchor);
    let end = (index + size - anchor).min(len);
    start..end
}

/// Separable rank filter. A flat rectangle decomposes into a row pass and a
/// column pass because clipping at the border is independent per axis.
fn rank_filter(plane: &Plane, element: &StructuringElement, extremum: Extremum) -> Plane {
    if element.is_identity() || plane.values.is_empty() {
        return plane.clone();
    }

    let (width, height) = (plane.width, plane.height);
    let mut rows = vec![0i64; plane.values.len()];
    for y in 0..height {
        let line = &plane.values[y * width..(y + 1) * width];
        for x in 0..width {
            let range = window(x, width, element.width, element.anchor.1);
            rows[y * width + x] = line[range]
                .iter()
                .copied()
                .reduce(|a, b| extremum.pick(a, b))
                .unwrap_or_default();
        }
    }

    let mut values = vec![0i64; plane.values.len()];
    for x in 0..width {
        for y in 0..height {
            let range = window(y, height, element.height, element.anchor.0);
            values[y * width + x] = range
                .map(|row| rows[row * width + x])
                .reduce(|a, b| extremum.pick(a, b))
                .unwrap_or_default();
        }
    }

    Plane {
        width,
        height,
        values,
    }
}

/// Morphological erosion (minimum over the element).
pub fn erosion(plane: &Plane, element: &StructuringElement) -> Plane {
    rank_filter(plane, element, Extremum::Min)
}

/// Morphological dilation (maximum over the element).
pub fn dilation(plane: &Plane, element: &StructuringElement) -> Plane {
    rank_filter(plane, element, Extremum::Max)
}

/// Erosion followed by dilation; removes foreground specks smaller than the element.
pub fn opening(plane: &Plane, element: &StructuringElement) -> Plane {
    dilation(&erosion(plane, element), element)
}

/// Dilation followed by erosion; fills background holes smaller than the element.
pub fn closing(plane: &Plane, element: &StructuringElement) -> Plane {
    erosion(&dilation(plane, element), element)
}

/// Opening then closing.
pub fn clean(plane: &Plane, element: &StructuringElement) -> Plane {
    closing(&opening(plane, element), element)
}

/// Cleans every sample of a host-side label-map batch in place.
pub fn clean_label_maps_in_place(maps: &mut LabelMaps, element: &StructuringElement) {
    let [batch, height, width] = maps.shape();
    for index in 0..batch {
        let sample = maps.sample_mut(index);
        let plane = Plane {
            width,
            height,
            values: sample.to_vec(),
        };
        sample.copy_from_slice(clean(&plane, element).values());
    }
}

/// Applies opening then closing to every sample of a `[batch, height, width]`
/// label tensor with a square element of side `kernel_size`.
///
/// # Errors
///
/// Returns [`MorphologyError::InvalidKernelSize`] when `kernel_size == 0`.
pub fn clean_label_maps<B: Backend>(
    labels: Tensor<B, 3, Int>,
    kernel_size: usize,
) -> Result<Tensor<B, 3, Int>, MorphologyError> {
    let element = StructuringElement::square(kernel_size)?;
    if element.is_identity() {
        return Ok(labels);
    }

    let device = labels.device();
    let mut maps = LabelMaps::from_tensor(labels);
    tracing::debug!(
        samples = maps.len(),
        kernel_size,
        "cleaning label maps with opening and closing"
    );
    clean_label_maps_in_place(&mut maps, &element);
    Ok(maps.into_tensor(&device))
}
