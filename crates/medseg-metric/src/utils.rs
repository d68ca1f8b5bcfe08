//! Shared reduction helpers and the all-in-one metric report.

use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor};
use medseg_util::SegmentationBatch;
use serde::{Deserialize, Serialize};

use crate::{
    dice::{dice, DiceMode},
    MetricError, MetricResult,
};

/// Additive smoothing used by IoU and F1 so empty masks stay finite.
pub const OVERLAP_SMOOTH: f64 = 1.0;

pub(crate) fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

/// Checks that both batches cover the same pixels and reduces them to label maps.
pub(crate) fn label_pair<B: Backend>(
    predictions: SegmentationBatch<B>,
    targets: SegmentationBatch<B>,
) -> MetricResult<(Tensor<B, 3, Int>, Tensor<B, 3, Int>)> {
    let predicted = predictions.spatial_dims();
    let actual = targets.spatial_dims();
    if predicted != actual {
        return Err(MetricError::ShapeMismatch { predicted, actual });
    }
    Ok((predictions.into_label_maps(), targets.into_label_maps()))
}

/// Pixel sums over a whole batch, with label maps used directly as masks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OverlapCounts {
    /// `Σ p·t`
    pub intersection: f64,
    /// `Σ p`
    pub predicted: f64,
    /// `Σ t`
    pub actual: f64,
}

impl OverlapCounts {
    pub fn from_label_maps<B: Backend>(
        predictions: Tensor<B, 3, Int>,
        targets: Tensor<B, 3, Int>,
    ) -> Self {
        let predictions = predictions.float();
        let targets = targets.float();
        Self {
            intersection: scalar((predictions.clone() * targets.clone()).sum()),
            predicted: scalar(predictions.sum()),
            actual: scalar(targets.sum()),
        }
    }

    /// # Errors
    ///
    /// Returns [`MetricError::ShapeMismatch`] if the batches differ in size.
    pub fn from_batches<B: Backend>(
        predictions: SegmentationBatch<B>,
        targets: SegmentationBatch<B>,
    ) -> MetricResult<Self> {
        let (predictions, targets) = label_pair(predictions, targets)?;
        Ok(Self::from_label_maps(predictions, targets))
    }

    pub fn union(&self) -> f64 {
        self.predicted + self.actual - self.intersection
    }

    pub fn true_positives(&self) -> f64 {
        self.intersection
    }

    /// `Σ (1 − p)·t`
    pub fn false_negatives(&self) -> f64 {
        self.actual - self.intersection
    }

    pub fn false_positives(&self) -> f64 {
        self.predicted - self.intersection
    }

    pub fn iou(&self) -> f64 {
        (self.intersection + OVERLAP_SMOOTH) / (self.union() + OVERLAP_SMOOTH)
    }

    pub fn f1(&self) -> f64 {
        let tp = self.true_positives();
        (2.0 * tp + OVERLAP_SMOOTH)
            / (2.0 * tp + self.false_positives() + self.false_negatives() + OVERLAP_SMOOTH)
    }
}

impl core::ops::AddAssign for OverlapCounts {
    fn add_assign(&mut self, other: Self) {
        self.intersection += other.intersection;
        self.predicted += other.predicted;
        self.actual += other.actual;
    }
}

/// Results from calculating all metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllMetricsResult {
    /// Eval-mode Dice loss, `1 − Dice` averaged over both classes.
    pub dice_loss: f64,
    pub iou: f64,
    pub f1: f64,
}

impl AllMetricsResult {
    pub fn dice_score(&self) -> f64 {
        1.0 - self.dice_loss
    }
}

/// Calculate Dice (eval mode), IoU and F1 for one pair of batches.
///
/// # Errors
///
/// Returns [`MetricError::ShapeMismatch`] if the batches differ in size.
pub fn calculate_all_metrics<B: Backend>(
    predictions: SegmentationBatch<B>,
    targets: SegmentationBatch<B>,
) -> MetricResult<AllMetricsResult> {
    let (predictions, targets) = label_pair(predictions, targets)?;
    let dice_loss = dice(
        SegmentationBatch::Labels(predictions.clone()),
        SegmentationBatch::Labels(targets.clone()),
        DiceMode::Eval,
    )?;
    let counts = OverlapCounts::from_label_maps(predictions, targets);

    Ok(AllMetricsResult {
        dice_loss,
        iou: counts.iou(),
        f1: counts.f1(),
    })
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn counts_follow_confusion_matrix() {
        let counts = OverlapCounts {
            intersection: 3.0,
            predicted: 5.0,
            actual: 4.0,
        };
        assert_eq!(counts.union(), 6.0);
        assert_eq!(counts.false_positives(), 2.0);
        assert_eq!(counts.false_negatives(), 1.0);
        assert_eq!(counts.iou(), 4.0 / 7.0);
        assert_eq!(counts.f1(), 7.0 / 10.0);
    }

    #[test]
    fn all_metrics_for_perfect_prediction() {
        let device = Default::default();
        let labels =
            Tensor::<TestBackend, 3, Int>::from_data([[[0, 1, 1], [0, 1, 0], [0, 0, 0]]], &device);

        let result = calculate_all_metrics(
            SegmentationBatch::Labels(labels.clone()),
            SegmentationBatch::Labels(labels),
        )
        .unwrap();

        assert_eq!(result.dice_loss, 0.0);
        assert_eq!(result.dice_score(), 1.0);
        assert_eq!(result.iou, 1.0);
        assert_eq!(result.f1, 1.0);
    }

    #[test]
    fn mismatched_batches_are_rejected() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 3, Int>::zeros([1, 2, 2], &device);
        let b = Tensor::<TestBackend, 3, Int>::zeros([1, 3, 2], &device);

        let result = calculate_all_metrics(
            SegmentationBatch::Labels(a),
            SegmentationBatch::Labels(b),
        );
        assert!(matches!(result, Err(MetricError::ShapeMismatch { .. })));
    }
}
