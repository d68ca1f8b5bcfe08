//! Dice loss for two-class segmentation.
//!
//! For each class `c` in `{0, 1}` the class loss is
//! `1 − (2·Σ(p_c·t_c) + 1) / (Σp_c + Σt_c + 1)`; the result is the mean over
//! both classes. Sums run over the whole batch, not per sample.

use core::marker::PhantomData;

use burn::{
    prelude::*,
    tensor::backend::Backend,
    train::metric::{
        state::{FormatOptions, NumericMetricState},
        Metric, MetricEntry, MetricMetadata, Numeric,
    },
};
use medseg_util::SegmentationBatch;

use crate::{
    input::SegmentationInput,
    utils::{label_pair, scalar},
    MetricError, MetricResult,
};

/// Number of classes averaged by the Dice loss.
pub const DICE_CLASSES: usize = 2;

/// Additive smoothing in both numerator and denominator.
pub const DICE_SMOOTH: f64 = 1.0;

/// How [`dice`] treats its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiceMode {
    /// Soft Dice on per-class probabilities; both inputs must be
    /// [`SegmentationBatch::Probabilities`].
    Backprop,
    /// Hard Dice on label maps; probabilities are reduced with an argmax first.
    Eval,
}

/// Soft Dice loss on `[B, C, H, W]` probability tensors, kept on the autodiff
/// graph. Only the first [`DICE_CLASSES`] channels are used.
///
/// # Panics
///
/// Panics if the shapes differ or there are fewer than [`DICE_CLASSES`]
/// channels; [`dice`] checks both before calling this.
pub fn dice_loss<B: Backend>(predictions: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
    let [batch, classes, height, width] = predictions.dims();
    assert_eq!(
        predictions.dims(),
        targets.dims(),
        "prediction and target shapes must match"
    );
    assert!(
        classes >= DICE_CLASSES,
        "dice needs {DICE_CLASSES} class channels, got {classes}"
    );

    let mut loss = Tensor::<B, 1>::zeros([1], &predictions.device());
    for class in 0..DICE_CLASSES {
        let pred = predictions
            .clone()
            .slice([0..batch, class..class + 1, 0..height, 0..width]);
        let target = targets
            .clone()
            .slice([0..batch, class..class + 1, 0..height, 0..width]);

        let intersection = (pred.clone() * target.clone()).sum();
        let denominator = (pred.sum() + target.sum()).add_scalar(DICE_SMOOTH);
        let score = intersection.mul_scalar(2.0).add_scalar(DICE_SMOOTH) / denominator;
        loss = loss + score.neg().add_scalar(1.0);
    }

    loss.div_scalar(DICE_CLASSES as f64)
}

/// Dice loss between a prediction batch and a target batch.
///
/// # Errors
///
/// - [`MetricError::EncodingMismatch`] in [`DiceMode::Backprop`] when either
///   input is a label map.
/// - [`MetricError::ShapeMismatch`] when the batches cover different pixels.
/// - [`MetricError::InsufficientClasses`] in [`DiceMode::Backprop`] with fewer
///   than two class channels.
pub fn dice<B: Backend>(
    predictions: SegmentationBatch<B>,
    targets: SegmentationBatch<B>,
    mode: DiceMode,
) -> MetricResult<f64> {
    match mode {
        DiceMode::Backprop => match (predictions, targets) {
            (
                SegmentationBatch::Probabilities(predictions),
                SegmentationBatch::Probabilities(targets),
            ) => {
                let [pb, pc, ph, pw] = predictions.dims();
                let [tb, tc, th, tw] = targets.dims();
                if [pb, ph, pw] != [tb, th, tw] || pc != tc {
                    return Err(MetricError::ShapeMismatch {
                        predicted: [pb, ph, pw],
                        actual: [tb, th, tw],
                    });
                }
                if pc < DICE_CLASSES {
                    return Err(MetricError::InsufficientClasses {
                        required: DICE_CLASSES,
                        actual: pc,
                    });
                }
                Ok(scalar(dice_loss(predictions, targets)))
            }
            (predictions, targets) => Err(MetricError::EncodingMismatch {
                mode,
                predictions: predictions.encoding(),
                targets: targets.encoding(),
            }),
        },
        DiceMode::Eval => {
            let (predictions, targets) = label_pair(predictions, targets)?;
            Ok(eval_dice_loss(predictions, targets))
        }
    }
}

fn eval_dice_loss<B: Backend>(predictions: Tensor<B, 3, Int>, targets: Tensor<B, 3, Int>) -> f64 {
    let total: f64 = (0..DICE_CLASSES)
        .map(|class| {
            let class = class as i64;
            let pred = predictions.clone().equal_elem(class).float();
            let target = targets.clone().equal_elem(class).float();

            let intersection = scalar((pred.clone() * target.clone()).sum());
            let denominator = scalar(pred.sum()) + scalar(target.sum()) + DICE_SMOOTH;
            1.0 - (2.0 * intersection + DICE_SMOOTH) / denominator
        })
        .sum();

    total / DICE_CLASSES as f64
}

// --- Dice Metric ---

/// Eval-mode Dice score (`1 − loss`) as a Burn metric. The logged entry
/// carries the running mean weighted by batch size.
#[derive(Default)]
pub struct DiceMetric<B: Backend> {
    state: NumericMetricState,
    _b: PhantomData<B>,
}

impl<B: Backend> DiceMetric<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one batch to the running mean.
    ///
    /// # Errors
    ///
    /// See [`dice`]. A rejected batch leaves the state untouched.
    pub fn accumulate(&mut self, item: &SegmentationInput<B>) -> MetricResult<MetricEntry> {
        let [batch, ..] = item.predictions.spatial_dims();
        let loss = dice(
            item.predictions.clone(),
            item.targets.clone(),
            DiceMode::Eval,
        )?;
        Ok(self.state.update(
            1.0 - loss,
            batch,
            FormatOptions::new(self.name()).precision(5),
        ))
    }
}

impl<B: Backend> Metric for DiceMetric<B> {
    type Input = SegmentationInput<B>;

    fn name(&self) -> String {
        "Dice".to_owned()
    }

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> MetricEntry {
        self.accumulate(item).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "skipping batch in Dice metric");
            let value = self.state.value();
            MetricEntry::new(self.name(), format!("{value:.5}"), format!("{value:.5}"))
        })
    }

    fn clear(&mut self) {
        self.state.reset();
    }
}

impl<B: Backend> Numeric for DiceMetric<B> {
    /// Score of the most recent batch.
    fn value(&self) -> f64 {
        self.state.value()
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};
    use medseg_util::Encoding;

    use super::*;
    use crate::tests::TestBackend;

    fn one_hot(mask: [[f32; 2]; 2]) -> Tensor<TestBackend, 4> {
        let device = Default::default();
        let foreground = Tensor::<TestBackend, 2>::from_data(mask, &device);
        let background = foreground.clone().neg().add_scalar(1.0);
        Tensor::stack::<3>(vec![background, foreground], 0).unsqueeze::<4>()
    }

    #[test]
    fn identical_probabilities_have_zero_loss() {
        let probs = one_hot([[0.0, 1.0], [1.0, 0.0]]);
        let loss = dice(
            SegmentationBatch::Probabilities(probs.clone()),
            SegmentationBatch::Probabilities(probs),
            DiceMode::Backprop,
        )
        .unwrap();
        assert!(loss.abs() < 1e-6, "loss = {loss}");
    }

    #[test]
    fn disjoint_masks_have_high_loss() {
        let predictions = one_hot([[0.0, 0.0], [0.0, 0.0]]);
        let targets = one_hot([[1.0, 1.0], [1.0, 1.0]]);
        let loss = dice(
            SegmentationBatch::Probabilities(predictions),
            SegmentationBatch::Probabilities(targets),
            DiceMode::Backprop,
        )
        .unwrap();
        // Each class: 1 − 1 / (4 + 0 + 1).
        assert!((loss - 0.8).abs() < 1e-6, "loss = {loss}");
    }

    #[test]
    fn empty_probabilities_stay_finite() {
        let device = Default::default();
        let zeros = Tensor::<TestBackend, 4>::zeros([1, 2, 3, 3], &device);
        let loss = dice(
            SegmentationBatch::Probabilities(zeros.clone()),
            SegmentationBatch::Probabilities(zeros),
            DiceMode::Backprop,
        )
        .unwrap();
        assert!(loss.is_finite());
        assert!(loss.abs() < 1e-6);
    }

    #[test]
    fn eval_mode_reduces_probabilities_with_argmax() {
        let soft = one_hot([[0.2, 0.9], [0.7, 0.1]]);
        let device = Default::default();
        let labels = Tensor::<TestBackend, 3, Int>::from_data([[[0, 1], [1, 0]]], &device);

        let loss = dice(
            SegmentationBatch::Probabilities(soft),
            SegmentationBatch::Labels(labels),
            DiceMode::Eval,
        )
        .unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn eval_mode_counts_each_class() {
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 3, Int>::from_data([[[1, 1], [0, 0]]], &device);
        let targets = Tensor::<TestBackend, 3, Int>::from_data([[[1, 0], [0, 0]]], &device);

        let loss = dice(
            SegmentationBatch::Labels(predictions),
            SegmentationBatch::Labels(targets),
            DiceMode::Eval,
        )
        .unwrap();
        // Background: 1 − (2·2 + 1) / (2 + 3 + 1); foreground: 1 − (2·1 + 1) / (2 + 1 + 1).
        let expected = ((1.0 - 5.0 / 6.0) + (1.0 - 3.0 / 4.0)) / 2.0;
        assert!((loss - expected).abs() < 1e-9, "loss = {loss}");
    }

    #[test]
    fn backprop_rejects_label_maps() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 3, Int>::zeros([1, 2, 2], &device);
        let result = dice(
            SegmentationBatch::Labels(labels.clone()),
            SegmentationBatch::Labels(labels),
            DiceMode::Backprop,
        );
        assert!(matches!(
            result,
            Err(MetricError::EncodingMismatch {
                predictions: Encoding::Labels,
                ..
            })
        ));
    }

    #[test]
    fn backprop_rejects_single_channel() {
        let device = Default::default();
        let probs = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let result = dice(
            SegmentationBatch::Probabilities(probs.clone()),
            SegmentationBatch::Probabilities(probs),
            DiceMode::Backprop,
        );
        assert!(matches!(
            result,
            Err(MetricError::InsufficientClasses { actual: 1, .. })
        ));
    }

    #[test]
    fn dice_loss_has_gradient() {
        type AutodiffBackend = Autodiff<NdArray>;
        let device = Default::default();
        let predictions =
            Tensor::<AutodiffBackend, 4>::full([1, 2, 2, 2], 0.5, &device).require_grad();
        let targets = Tensor::<AutodiffBackend, 4>::ones([1, 2, 2, 2], &device);

        let loss = dice_loss(predictions.clone(), targets);
        let grads = loss.backward();
        let grad = predictions.grad(&grads).unwrap();

        assert_eq!(grad.dims(), [1, 2, 2, 2]);
        let values: Vec<f32> = grad.into_data().iter::<f32>().collect();
        assert!(values.iter().all(|g| *g < 0.0), "grad = {values:?}");
    }

    #[test]
    fn eval_mode_on_empty_label_maps_stays_finite() {
        let device = Default::default();
        let empty = Tensor::<TestBackend, 3, Int>::zeros([2, 3, 3], &device);
        let loss = dice(
            SegmentationBatch::Labels(empty.clone()),
            SegmentationBatch::Labels(empty),
            DiceMode::Eval,
        )
        .unwrap();
        // Background matches everywhere; the empty foreground is 1 / 1.
        assert!(loss.is_finite());
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn metric_tracks_latest_batch_and_running_mean() {
        let device = Default::default();
        let good = Tensor::<TestBackend, 3, Int>::from_data([[[0, 1], [1, 0]]], &device);
        let predictions =
            Tensor::<TestBackend, 3, Int>::from_data([[[1, 1], [0, 0]], [[1, 1], [0, 0]]], &device);
        let targets =
            Tensor::<TestBackend, 3, Int>::from_data([[[1, 0], [0, 0]], [[1, 0], [0, 0]]], &device);
        let mut metric = DiceMetric::<TestBackend>::new();

        metric
            .accumulate(&SegmentationInput::new(good.clone().into(), good.into()))
            .unwrap();
        assert_eq!(metric.value(), 1.0);

        let entry = metric
            .accumulate(&SegmentationInput::new(predictions.into(), targets.into()))
            .unwrap();
        // Background: (2·4 + 1) / (4 + 6 + 1); foreground: (2·2 + 1) / (4 + 2 + 1).
        let second = (9.0 / 11.0 + 5.0 / 7.0) / 2.0;
        assert!((metric.value() - second).abs() < 1e-9);
        // One image at 1.0 and two at the second score.
        let running = (1.0 + 2.0 * second) / 3.0;
        assert!(entry.formatted.contains(&format!("epoch {running:.5}")));

        metric.clear();
        assert!(metric.value().is_nan());
    }

    #[test]
    fn metric_skips_mismatched_batches() {
        let device = Default::default();
        let small = Tensor::<TestBackend, 3, Int>::zeros([1, 2, 2], &device);
        let large = Tensor::<TestBackend, 3, Int>::zeros([1, 3, 3], &device);
        let mut metric = DiceMetric::<TestBackend>::new();

        let result = metric.accumulate(&SegmentationInput::new(small.into(), large.into()));
        assert!(matches!(result, Err(MetricError::ShapeMismatch { .. })));
        assert!(metric.value().is_nan());
    }
}
