//! Canonical representation of segmentation batches.
//!
//! Predictions and targets reach the metric and post-processing code in one of
//! two encodings: class-probability grids `[batch, classes, height, width]`, or
//! label maps `[batch, height, width]` that have already been reduced. The
//! encoding is always carried explicitly by [`SegmentationBatch`]; it is never
//! guessed from the rank of a tensor.

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use thiserror::Error;

/// Errors raised while normalizing raw inputs into a [`SegmentationBatch`].
#[derive(Debug, Error)]
pub enum LabelError {
    #[error("unsupported input: {encoding} data must have rank {expected}, got shape {shape:?}")]
    UnsupportedInput {
        encoding: Encoding,
        expected: usize,
        shape: Vec<usize>,
    },

    #[error("label maps have {actual} values, expected {expected} for shape {shape:?}")]
    DataLengthMismatch {
        expected: usize,
        actual: usize,
        shape: [usize; 3],
    },
}

/// How the values of a batch are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Per-class probability grids with a class axis at dimension 1.
    Probabilities,
    /// Integer class indices, one per pixel.
    Labels,
}

impl core::fmt::Display for Encoding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Probabilities => f.write_str("probability"),
            Self::Labels => f.write_str("label-map"),
        }
    }
}

/// A batch of predictions or targets in an explicit encoding.
#[derive(Debug, Clone)]
pub enum SegmentationBatch<B: Backend> {
    /// `[batch, classes, height, width]` probability grids.
    Probabilities(Tensor<B, 4>),
    /// `[batch, height, width]` integer label maps.
    Labels(Tensor<B, 3, Int>),
}

impl<B: Backend> SegmentationBatch<B> {
    /// Builds a batch from plain numeric data.
    ///
    /// This is the single place where untyped arrays enter the pipeline: the
    /// caller states the encoding and the rank is checked against it.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::UnsupportedInput`] when the rank does not match
    /// the declared encoding.
    pub fn from_data(
        data: TensorData,
        encoding: Encoding,
        device: &B::Device,
    ) -> Result<Self, LabelError> {
        let rank = data.shape.len();
        match (encoding, rank) {
            (Encoding::Probabilities, 4) => {
                Ok(Self::Probabilities(Tensor::from_data(data, device)))
            }
            (Encoding::Labels, 3) => Ok(Self::Labels(Tensor::from_data(data, device))),
            _ => Err(LabelError::UnsupportedInput {
                encoding,
                expected: match encoding {
                    Encoding::Probabilities => 4,
                    Encoding::Labels => 3,
                },
                shape: data.shape,
            }),
        }
    }

    /// The encoding of this batch.
    pub const fn encoding(&self) -> Encoding {
        match self {
            Self::Probabilities(_) => Encoding::Probabilities,
            Self::Labels(_) => Encoding::Labels,
        }
    }

    /// `[batch, height, width]` of the batch, ignoring any class axis.
    pub fn spatial_dims(&self) -> [usize; 3] {
        match self {
            Self::Probabilities(tensor) => {
                let [batch, _, height, width] = tensor.dims();
                [batch, height, width]
            }
            Self::Labels(tensor) => tensor.dims(),
        }
    }

    pub fn device(&self) -> B::Device {
        match self {
            Self::Probabilities(tensor) => tensor.device(),
            Self::Labels(tensor) => tensor.device(),
        }
    }

    /// Reduces the batch to label maps, taking the arg-max over the class
    /// axis for probability grids.
    pub fn into_label_maps(self) -> Tensor<B, 3, Int> {
        match self {
            Self::Probabilities(tensor) => tensor.argmax(1).squeeze::<3>(1),
            Self::Labels(tensor) => tensor,
        }
    }
}

impl<B: Backend> From<Tensor<B, 4>> for SegmentationBatch<B> {
    fn from(tensor: Tensor<B, 4>) -> Self {
        Self::Probabilities(tensor)
    }
}

impl<B: Backend> From<Tensor<B, 3, Int>> for SegmentationBatch<B> {
    fn from(tensor: Tensor<B, 3, Int>) -> Self {
        Self::Labels(tensor)
    }
}

/// Host-side copy of a label-map batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMaps {
    values: Vec<i64>,
    shape: [usize; 3],
}

impl LabelMaps {
    /// # Errors
    ///
    /// Returns [`LabelError::DataLengthMismatch`] if `values` does not hold
    /// exactly `batch * height * width` entries.
    pub fn new(values: Vec<i64>, shape: [usize; 3]) -> Result<Self, LabelError> {
        let expected = shape.iter().product::<usize>();
        if values.len() != expected {
            return Err(LabelError::DataLengthMismatch {
                expected,
                actual: values.len(),
                shape,
            });
        }
        Ok(Self { values, shape })
    }

    /// Copies a label tensor to the host.
    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 3, Int>) -> Self {
        let shape = tensor.dims();
        let values = tensor.into_data().iter::<i64>().collect();
        Self { values, shape }
    }

    pub fn into_tensor<B: Backend>(self, device: &B::Device) -> Tensor<B, 3, Int> {
        Tensor::from_data(TensorData::new(self.values, self.shape), device)
    }

    /// `[batch, height, width]`.
    pub const fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] == 0
    }

    /// Values of one sample in row-major order.
    pub fn sample(&self, index: usize) -> &[i64] {
        let plane = self.shape[1] * self.shape[2];
        &self.values[index * plane..(index + 1) * plane]
    }

    pub fn sample_mut(&mut self, index: usize) -> &mut [i64] {
        let plane = self.shape[1] * self.shape[2];
        &mut self.values[index * plane..(index + 1) * plane]
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn probabilities_reduce_to_argmax_labels() {
        let device = Default::default();
        let probs = Tensor::<TestBackend, 4>::from_data(
            [[[[0.9, 0.2], [0.4, 0.1]], [[0.1, 0.8], [0.6, 0.9]]]],
            &device,
        );

        let labels = SegmentationBatch::from(probs).into_label_maps();
        assert_eq!(labels.dims(), [1, 2, 2]);

        let values: Vec<i64> = labels.into_data().iter::<i64>().collect();
        assert_eq!(values, vec![0, 1, 1, 1]);
    }

    #[test]
    fn label_maps_pass_through_unchanged() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 3, Int>::from_data([[[0, 1], [1, 0]]], &device);

        let batch = SegmentationBatch::from(labels);
        assert_eq!(batch.encoding(), Encoding::Labels);
        assert_eq!(batch.spatial_dims(), [1, 2, 2]);

        let values: Vec<i64> = batch.into_label_maps().into_data().iter::<i64>().collect();
        assert_eq!(values, vec![0, 1, 1, 0]);
    }

    #[test]
    fn from_data_rejects_rank_that_contradicts_encoding() {
        let device = Default::default();
        let data = TensorData::new(vec![0.0f32; 8], [2, 2, 2]);

        let result =
            SegmentationBatch::<TestBackend>::from_data(data, Encoding::Probabilities, &device);
        assert!(matches!(
            result,
            Err(LabelError::UnsupportedInput { expected: 4, .. })
        ));
    }

    #[test]
    fn from_data_accepts_matching_rank() {
        let device = Default::default();
        let data = TensorData::new(vec![0i64, 1, 1, 0], [1, 2, 2]);

        let batch =
            SegmentationBatch::<TestBackend>::from_data(data, Encoding::Labels, &device).unwrap();
        assert_eq!(batch.encoding(), Encoding::Labels);
    }

    #[test]
    fn label_maps_validate_length() {
        assert!(LabelMaps::new(vec![0; 3], [1, 2, 2]).is_err());

        let maps = LabelMaps::new(vec![0, 1, 2, 3, 4, 5, 6, 7], [2, 2, 2]).unwrap();
        assert_eq!(maps.sample(1), &[4, 5, 6, 7]);
    }
}
