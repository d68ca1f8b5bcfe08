//! Scoring a folder of predicted masks against a folder of reference masks.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use burn::{tensor::backend::Backend, train::metric::Numeric};
use medseg_metric::{
    calculate_all_metrics, AllMetricsResult, F1Metric, IoUMetric, SegmentationInput,
};
use medseg_util::{
    clean_label_maps,
    image::{is_supported_image_format, load_binary_mask},
    ProgressBar, SegmentationBatch,
};
use serde::Serialize;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluateOptions {
    /// Clean predictions with an opening and closing before scoring.
    pub erode: bool,
    pub kernel_size: usize,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self {
            erode: false,
            kernel_size: medseg_util::DEFAULT_KERNEL_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageScore {
    /// Path relative to the prediction folder.
    pub name: PathBuf,
    pub metrics: AllMetricsResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub images: Vec<ImageScore>,
    /// Mean Dice over images; IoU and F1 over the pooled pixel counts.
    pub overall: AllMetricsResult,
    /// Predictions without a reference mask of the same name.
    pub unmatched: Vec<PathBuf>,
}

impl EvaluationReport {
    /// Writes the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be created or written.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Pairs every image under `predictions` with the file at the same relative
/// path under `targets` and scores each pair. Non-zero pixels are foreground.
///
/// The progress bar is drawn to `progress`.
///
/// # Errors
///
/// Fails when a folder cannot be read, an image cannot be decoded, no pair is
/// found, or a pair differs in size.
pub fn evaluate_directories<B: Backend, W: Write>(
    predictions: &Path,
    targets: &Path,
    options: &EvaluateOptions,
    device: &B::Device,
    progress: W,
) -> Result<EvaluationReport> {
    let mut pairs = Vec::new();
    let mut unmatched = Vec::new();
    for entry in WalkDir::new(predictions).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to read {}", predictions.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || !is_supported_image_format(path) {
            continue;
        }
        let relative = path.strip_prefix(predictions)?.to_path_buf();
        let target = targets.join(&relative);
        if target.is_file() {
            pairs.push((relative, path.to_path_buf(), target));
        } else {
            tracing::warn!(prediction = %path.display(), "no reference mask, skipping");
            unmatched.push(relative);
        }
    }

    if pairs.is_empty() {
        anyhow::bail!(
            "no prediction in {} has a reference mask in {}",
            predictions.display(),
            targets.display()
        );
    }
    tracing::info!(
        pairs = pairs.len(),
        unmatched = unmatched.len(),
        erode = options.erode,
        "evaluating masks"
    );

    let mut dice_sum = 0.0;
    let mut iou = IoUMetric::<B>::new();
    let mut f1 = F1Metric::<B>::new();
    let mut bar = ProgressBar::new(
        progress,
        pairs.len(),
        medseg_util::progress::terminal_width(),
    );
    let mut images = Vec::with_capacity(pairs.len());

    for (index, (name, prediction_path, target_path)) in pairs.into_iter().enumerate() {
        let mut prediction = load_binary_mask::<B, _>(&prediction_path, device)?;
        let target = load_binary_mask::<B, _>(&target_path, device)?;
        if options.erode {
            prediction = clean_label_maps(prediction, options.kernel_size)?;
        }

        let input = SegmentationInput::new(
            SegmentationBatch::Labels(prediction),
            SegmentationBatch::Labels(target),
        );
        let metrics = calculate_all_metrics(input.predictions.clone(), input.targets.clone())
            .with_context(|| format!("failed to score {}", name.display()))?;
        dice_sum += metrics.dice_score();
        iou.accumulate(&input)?;
        f1.accumulate(&input)?;

        tracing::debug!(
            image = %name.display(),
            dice = metrics.dice_score(),
            iou = metrics.iou,
            f1 = metrics.f1,
            "scored"
        );
        bar.tick(
            index,
            Some(&format!(
                "Dice: {:.4} | IoU: {:.4} | F1: {:.4}",
                dice_sum / (index + 1) as f64,
                iou.value(),
                f1.value()
            )),
        )?;
        images.push(ImageScore { name, metrics });
    }

    let overall = AllMetricsResult {
        dice_loss: 1.0 - dice_sum / images.len() as f64,
        iou: iou.value(),
        f1: f1.value(),
    };
    tracing::info!(
        dice = overall.dice_score(),
        iou = overall.iou,
        f1 = overall.f1,
        "evaluation finished"
    );

    Ok(EvaluationReport {
        images,
        overall,
        unmatched,
    })
}
