//! F1 score from whole-batch confusion counts.

use core::marker::PhantomData;

use burn::{
    tensor::backend::Backend,
    train::metric::{Metric, MetricEntry, MetricMetadata, Numeric},
};
use medseg_util::SegmentationBatch;

use crate::{input::SegmentationInput, utils::OverlapCounts, MetricResult};

/// Smoothed F1, `(2·tp + 1) / (2·tp + fp + fn + 1)`, with
/// `tp = Σ p·t`, `fn = Σ (1 − p)·t` and `fp = Σp − tp`.
///
/// # Errors
///
/// Returns [`crate::MetricError::ShapeMismatch`] if the batches differ in size.
pub fn f1<B: Backend>(
    predictions: SegmentationBatch<B>,
    targets: SegmentationBatch<B>,
) -> MetricResult<f64> {
    Ok(OverlapCounts::from_batches(predictions, targets)?.f1())
}

/// F1 over everything seen since the last [`Metric::clear`].
#[derive(Debug, Clone, Default)]
pub struct F1Metric<B: Backend> {
    counts: OverlapCounts,
    count: usize,
    _b: PhantomData<B>,
}

impl<B: Backend> F1Metric<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// See [`f1`].
    pub fn accumulate(&mut self, item: &SegmentationInput<B>) -> MetricResult<()> {
        let [batch, ..] = item.predictions.spatial_dims();
        self.counts +=
            OverlapCounts::from_batches(item.predictions.clone(), item.targets.clone())?;
        self.count += batch;
        Ok(())
    }

    fn f1_value(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.counts.f1()
    }
}

impl<B: Backend> Metric for F1Metric<B> {
    type Input = SegmentationInput<B>;

    fn name(&self) -> String {
        "F1".to_string()
    }

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> MetricEntry {
        if let Err(err) = self.accumulate(item) {
            tracing::warn!(error = %err, "skipping batch in F1 metric");
        }
        let value = self.f1_value();
        MetricEntry::new(self.name(), format!("{value:.5}"), format!("{value:.5}"))
    }

    fn clear(&mut self) {
        self.counts = OverlapCounts::default();
        self.count = 0;
    }
}

impl<B: Backend> Numeric for F1Metric<B> {
    fn value(&self) -> f64 {
        self.f1_value()
    }
}
