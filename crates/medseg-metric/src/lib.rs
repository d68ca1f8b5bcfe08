//! # medseg Metrics
//!
//! Overlap metrics for binary segmentation, computed with the Burn framework.
//!
//! Every function takes a [`SegmentationBatch`], which says explicitly whether
//! a tensor holds per-class probabilities `[B, C, H, W]` or label maps
//! `[B, H, W]`. Probabilities are reduced to label maps with an argmax over the
//! class axis before anything is counted.
//!
//! ## Implemented Metrics
//!
//! - [`dice`]: Dice loss averaged over the two classes, in a differentiable
//!   ([`DiceMode::Backprop`]) or label-map ([`DiceMode::Eval`]) flavour
//! - [`iou`]: smoothed intersection over union of the whole batch
//! - [`f1`]: smoothed F1 from whole-batch confusion counts
//! - [`DiceMetric`], [`IoUMetric`], [`F1Metric`]: `burn::train` adaptors that
//!   accumulate over an epoch
//!
//! ## Usage
//!
//! ```rust,ignore
//! use medseg_metric::{calculate_all_metrics, SegmentationBatch};
//!
//! let result = calculate_all_metrics(
//!     SegmentationBatch::Labels(predicted),
//!     SegmentationBatch::Labels(ground_truth),
//! )?;
//! println!("dice {:.4} iou {:.4} f1 {:.4}", result.dice_score(), result.iou, result.f1);
//! ```

pub mod dice;
pub mod f1;
pub mod input;
pub mod iou;
pub mod utils;

pub use dice::{dice, dice_loss, DiceMetric, DiceMode, DICE_CLASSES, DICE_SMOOTH};
pub use f1::{f1, F1Metric};
pub use input::SegmentationInput;
pub use iou::{iou, IoUMetric};
pub use medseg_util::{Encoding, SegmentationBatch};
use thiserror::Error;
pub use utils::{calculate_all_metrics, AllMetricsResult, OverlapCounts, OVERLAP_SMOOTH};

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("{mode:?} dice needs probabilities for both inputs, got {predictions} predictions and {targets} targets")]
    EncodingMismatch {
        mode: DiceMode,
        predictions: Encoding,
        targets: Encoding,
    },

    #[error("prediction covers {predicted:?} pixels but target covers {actual:?}")]
    ShapeMismatch {
        predicted: [usize; 3],
        actual: [usize; 3],
    },

    #[error("dice needs at least {required} class channels, got {actual}")]
    InsufficientClasses { required: usize, actual: usize },
}

pub type MetricResult<T> = Result<T, MetricError>;

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    pub type TestBackend = NdArray;
}
