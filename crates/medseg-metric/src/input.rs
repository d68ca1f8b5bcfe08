//! Input structure shared by the `burn::train` metric adaptors.

use burn::tensor::backend::Backend;
use medseg_util::SegmentationBatch;

/// Dice, IoU and F1 metric input.
#[derive(Debug, Clone)]
pub struct SegmentationInput<B: Backend> {
    /// Network output, probabilities `[B, C, H, W]` or labels `[B, H, W]`.
    pub predictions: SegmentationBatch<B>,
    /// Ground truth in either encoding.
    pub targets: SegmentationBatch<B>,
}

impl<B: Backend> SegmentationInput<B> {
    pub fn new(predictions: SegmentationBatch<B>, targets: SegmentationBatch<B>) -> Self {
        Self {
            predictions,
            targets,
        }
    }
}
