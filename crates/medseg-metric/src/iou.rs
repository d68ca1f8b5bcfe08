//! IoU (Intersection over Union) over a whole batch.
//!
//! Label values are used directly as masks, so with labels in `{0, 1}` this
//! is the foreground IoU: `(Σ p·t + 1) / (Σp + Σt − Σ p·t + 1)`.

use core::marker::PhantomData;

use burn::{
    tensor::backend::Backend,
    train::metric::{Metric, MetricEntry, MetricMetadata, Numeric},
};
use medseg_util::SegmentationBatch;

use crate::{input::SegmentationInput, utils::OverlapCounts, MetricResult};

/// Smoothed IoU of two batches. Both sides are reduced to label maps first.
///
/// # Errors
///
/// Returns [`crate::MetricError::ShapeMismatch`] if the batches differ in size.
pub fn iou<B: Backend>(
    predictions: SegmentationBatch<B>,
    targets: SegmentationBatch<B>,
) -> MetricResult<f64> {
    Ok(OverlapCounts::from_batches(predictions, targets)?.iou())
}

// --- IoU Metric ---

/// IoU over everything seen since the last [`Metric::clear`].
#[derive(Debug, Clone, Default)]
pub struct IoUMetric<B: Backend> {
    counts: OverlapCounts,
    count: usize,
    _b: PhantomData<B>,
}

impl<B: Backend> IoUMetric<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one batch to the running counts.
    ///
    /// # Errors
    ///
    /// See [`iou`].
    pub fn accumulate(&mut self, item: &SegmentationInput<B>) -> MetricResult<()> {
        let [batch, ..] = item.predictions.spatial_dims();
        self.counts +=
            OverlapCounts::from_batches(item.predictions.clone(), item.targets.clone())?;
        self.count += batch;
        Ok(())
    }

    fn iou_value(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.counts.iou()
    }
}

impl<B: Backend> Metric for IoUMetric<B> {
    type Input = SegmentationInput<B>;

    fn name(&self) -> String {
        "IoU".to_string()
    }

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> MetricEntry {
        if let Err(err) = self.accumulate(item) {
            tracing::warn!(error = %err, "skipping batch in IoU metric");
        }
        let value = self.iou_value();
        MetricEntry::new(self.name(), format!("{value:.5}"), format!("{value:.5}"))
    }

    fn clear(&mut self) {
        self.counts = OverlapCounts::default();
        self.count = 0;
    }
}

impl<B: Backend> Numeric for IoUMetric<B> {
    fn value(&self) -> f64 {
        self.iou_value()
    }
}
