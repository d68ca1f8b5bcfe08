//! Post-processing of network outputs.
//!
//! Predictions are reduced to label maps, optionally cleaned with a
//! morphological opening and closing, and then either handed back to the
//! caller or written next to each other under an output root, one folder per
//! source folder.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use burn::{
    prelude::*,
    tensor::{backend::Backend, Int, Tensor},
};
use medseg_util::{
    clean_label_maps,
    image::{labels_to_pixels, save_gray, save_rgb, ImageError},
    LabelMaps, MorphologyError, SegmentationBatch,
};
use thiserror::Error;

/// Value painted into the green channel where uncertainty is high.
const UNCERTAINTY_OVERLAY: f32 = 165.0;

/// Suffix of the thresholded uncertainty image written beside each composite.
const UNCERTAINTY_SUFFIX: &str = "-Uncertainty.jpg";

#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("batch size mismatch: {images} images but {actual} {what}")]
    BatchMismatch {
        what: &'static str,
        images: usize,
        actual: usize,
    },

    #[error("{what} grid {actual:?} does not match image grid {expected:?}")]
    SpatialMismatch {
        what: &'static str,
        expected: [usize; 2],
        actual: [usize; 2],
    },

    #[error("images must be single-channel, got {channels} channels")]
    ImageChannels { channels: usize },

    #[error("invalid output path '{path}': {reason}")]
    InvalidPath { path: PathBuf, reason: &'static str },

    #[error("failed to create output folder '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Morphology(#[from] MorphologyError),
}

pub type PostProcessResult<T> = Result<T, PostProcessError>;

/// Colour channel that carries the predicted mask in overlay composites.
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum OverlayChannel {
    Red,
    Green,
    Blue,
}

impl OverlayChannel {
    /// Index into an interleaved RGB pixel.
    pub const fn index(&self) -> usize {
        match self {
            Self::Red => 0,
            Self::Green => 1,
            Self::Blue => 2,
        }
    }
}

/// Source of a per-pixel uncertainty estimate.
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum UncertaintyKind {
    /// Data noise, bounded by 0.25 for a two-class softmax.
    Aleatoric,
    /// Model uncertainty.
    Epistemic,
}

/// Per-pixel uncertainty `[batch, height, width]`.
#[derive(Debug, Clone)]
pub struct UncertaintyMap<B: Backend> {
    pub kind: UncertaintyKind,
    pub values: Tensor<B, 3>,
}

impl<B: Backend> UncertaintyMap<B> {
    pub fn aleatoric(values: Tensor<B, 3>) -> Self {
        Self {
            kind: UncertaintyKind::Aleatoric,
            values,
        }
    }

    pub fn epistemic(values: Tensor<B, 3>) -> Self {
        Self {
            kind: UncertaintyKind::Epistemic,
            values,
        }
    }
}

#[derive(Config, Debug)]
pub struct PostProcessConfig {
    /// Root under which one folder per source folder is created.
    pub output_root: String,
    /// Clean label maps with an opening and a closing.
    #[config(default = true)]
    pub erode: bool,
    #[config(default = 7)]
    pub kernel_size: usize,
    /// Write image/mask composites instead of bare masks.
    #[config(default = true)]
    pub overlap: bool,
    /// Scaled uncertainty above this value counts as uncertain.
    #[config(default = 15.0)]
    pub uncertainty_threshold: f32,
    /// Maps the aleatoric maximum of 0.25 to 255.
    #[config(default = 1020.0)]
    pub aleatoric_scale: f32,
    #[config(default = 1.0)]
    pub epistemic_scale: f32,
    #[config(default = "OverlayChannel::Blue")]
    pub overlay_channel: OverlayChannel,
    /// Also paint uncertain pixels green in the composite.
    #[config(default = false)]
    pub overlay_uncertainty: bool,
}

impl PostProcessConfig {
    pub fn init(&self) -> PostProcessor {
        PostProcessor {
            config: self.clone(),
        }
    }

    fn uncertainty_scale(&self, kind: &UncertaintyKind) -> f32 {
        match kind {
            UncertaintyKind::Aleatoric => self.aleatoric_scale,
            UncertaintyKind::Epistemic => self.epistemic_scale,
        }
    }
}

/// One batch to post-process.
#[derive(Debug, Clone)]
pub struct PostProcessInput<B: Backend> {
    /// Grayscale images `[batch, 1, height, width]` in `[0, 1]`.
    pub images: Tensor<B, 4>,
    pub predictions: SegmentationBatch<B>,
    pub uncertainty: Option<UncertaintyMap<B>>,
}

impl<B: Backend> PostProcessInput<B> {
    pub fn new(images: Tensor<B, 4>, predictions: SegmentationBatch<B>) -> Self {
        Self {
            images,
            predictions,
            uncertainty: None,
        }
    }

    pub fn with_uncertainty(mut self, uncertainty: UncertaintyMap<B>) -> Self {
        self.uncertainty = Some(uncertainty);
        self
    }
}

#[derive(Debug, Clone)]
pub enum OutputMode {
    /// Hand the label maps back without touching the filesystem.
    Return,
    /// Write one output per sample; `paths[i]` is the source path of sample `i`.
    Save { paths: Vec<PathBuf> },
}

#[derive(Debug, Clone)]
pub enum PostProcessOutcome<B: Backend> {
    /// Integer class maps `[batch, height, width]`.
    LabelMaps(Tensor<B, 3, Int>),
    /// Every file written, in write order.
    Written(Vec<PathBuf>),
}

#[derive(Debug, Clone)]
pub struct PostProcessor {
    config: PostProcessConfig,
}

impl PostProcessor {
    pub fn config(&self) -> &PostProcessConfig {
        &self.config
    }

    /// Reduces, cleans and then returns or writes a batch of predictions.
    ///
    /// # Errors
    ///
    /// Fails on inconsistent batch sizes or grids, paths without a parent
    /// folder or file name, folder creation errors other than the folder
    /// already existing, and image encoding errors.
    pub fn process<B: Backend>(
        &self,
        input: PostProcessInput<B>,
        mode: OutputMode,
    ) -> PostProcessResult<PostProcessOutcome<B>> {
        let PostProcessInput {
            images,
            predictions,
            uncertainty,
        } = input;

        let [batch, channels, height, width] = images.dims();
        if channels != 1 {
            return Err(PostProcessError::ImageChannels { channels });
        }
        let [p_batch, p_height, p_width] = predictions.spatial_dims();
        check_batch("predictions", batch, p_batch)?;
        check_grid("prediction", [height, width], [p_height, p_width])?;
        if let Some(map) = &uncertainty {
            let [u_batch, u_height, u_width] = map.values.dims();
            check_batch("uncertainty maps", batch, u_batch)?;
            check_grid("uncertainty", [height, width], [u_height, u_width])?;
        }

        let mut labels = predictions.into_label_maps();
        if self.config.erode {
            labels = clean_label_maps(labels, self.config.kernel_size)?;
        }

        let paths = match mode {
            OutputMode::Return => return Ok(PostProcessOutcome::LabelMaps(labels)),
            OutputMode::Save { paths } => paths,
        };
        check_batch("output paths", batch, paths.len())?;

        let gray: Vec<f32> = images
            .into_data()
            .iter::<f32>()
            .map(|v| v * 255.0)
            .collect();
        let labels = LabelMaps::from_tensor(labels);
        let uncertain = uncertainty.map(|map| {
            let scale = self.config.uncertainty_scale(&map.kind);
            let threshold = self.config.uncertainty_threshold;
            map.values
                .into_data()
                .iter::<f32>()
                .map(|v| v * scale > threshold)
                .collect::<Vec<bool>>()
        });

        let plane = height * width;
        let mut written = Vec::with_capacity(batch * 2);
        for (index, source) in paths.iter().enumerate() {
            let folder = self.output_folder(source)?;
            create_dir(&folder)?;
            let file_name = source
                .file_name()
                .ok_or_else(|| invalid_path(source, "no file name"))?;
            let output_path = folder.join(file_name);
            let mask = labels.sample(index);

            if self.config.overlap {
                let uncertain = uncertain
                    .as_ref()
                    .map(|flags| &flags[index * plane..(index + 1) * plane]);

                if let Some(flags) = uncertain {
                    let path = folder.join(uncertainty_file_name(source)?);
                    let pixels = flags.iter().map(|&u| if u { 255 } else { 0 }).collect();
                    save_gray(&path, width, height, pixels)?;
                    written.push(path);
                }

                let overlay = uncertain.filter(|_| self.config.overlay_uncertainty);
                let pixels =
                    self.composite(&gray[index * plane..(index + 1) * plane], mask, overlay);
                save_rgb(&output_path, width, height, pixels)?;
            } else {
                save_gray(&output_path, width, height, labels_to_pixels(mask, 255))?;
            }

            tracing::debug!(path = %output_path.display(), "post-processed sample written");
            written.push(output_path);
        }

        tracing::info!(
            samples = batch,
            files = written.len(),
            root = %self.config.output_root,
            "post-processing outputs written"
        );
        Ok(PostProcessOutcome::Written(written))
    }

    /// `output_root/<name of the folder holding source>`.
    fn output_folder(&self, source: &Path) -> PostProcessResult<PathBuf> {
        let parent = source
            .parent()
            .and_then(Path::file_name)
            .ok_or_else(|| invalid_path(source, "no parent folder"))?;
        Ok(Path::new(&self.config.output_root).join(parent))
    }

    /// Gray image in all channels with the mask added to the overlay channel,
    /// rescaled so its brightest value is 255.
    fn composite(&self, gray: &[f32], mask: &[i64], uncertain: Option<&[bool]>) -> Vec<u8> {
        let channel = self.config.overlay_channel.index();
        let mut rgb = Vec::with_capacity(gray.len() * 3);
        for (pixel, (&g, &label)) in gray.iter().zip(mask).enumerate() {
            let mut value = [g; 3];
            value[channel] += label as f32 * 255.0;
            if uncertain.is_some_and(|flags| flags[pixel]) {
                value[OverlayChannel::Green.index()] += UNCERTAINTY_OVERLAY;
            }
            rgb.extend(value);
        }

        let max = rgb.iter().copied().fold(0.0f32, f32::max);
        let divisor = if max > 0.0 { max } else { 1.0 };
        rgb.into_iter()
            .map(|v| (v / divisor * 255.0).round().clamp(0.0, 255.0) as u8)
            .collect()
    }
}

fn check_batch(what: &'static str, images: usize, actual: usize) -> PostProcessResult<()> {
    if images != actual {
        return Err(PostProcessError::BatchMismatch {
            what,
            images,
            actual,
        });
    }
    Ok(())
}

fn check_grid(
    what: &'static str,
    expected: [usize; 2],
    actual: [usize; 2],
) -> PostProcessResult<()> {
    if expected != actual {
        return Err(PostProcessError::SpatialMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

fn invalid_path(path: &Path, reason: &'static str) -> PostProcessError {
    PostProcessError::InvalidPath {
        path: path.to_path_buf(),
        reason,
    }
}

/// Creates `path`; an existing folder is fine, any other failure is not.
fn create_dir(path: &Path) -> PostProcessResult<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(PostProcessError::CreateDir {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// `<name up to its first '.'>-Uncertainty.jpg`
fn uncertainty_file_name(source: &Path) -> PostProcessResult<String> {
    let name = source
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| invalid_path(source, "file name is not valid UTF-8"))?;
    let stem = name.split('.').next().unwrap_or(name);
    Ok(format!("{stem}{UNCERTAINTY_SUFFIX}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn default_config() {
        let config = PostProcessConfig::new("out".to_string());
        assert!(config.erode);
        assert!(config.overlap);
        assert_eq!(config.kernel_size, 7);
        assert_eq!(config.uncertainty_threshold, 15.0);
        assert_eq!(config.aleatoric_scale, 1020.0);
        assert_eq!(config.epistemic_scale, 1.0);
        assert_eq!(config.overlay_channel, OverlayChannel::Blue);
        assert!(!config.overlay_uncertainty);
    }

    #[test]
    fn uncertainty_name_cuts_at_first_dot() {
        assert_eq!(
            uncertainty_file_name(Path::new("case/slice.001.png")).unwrap(),
            "slice-Uncertainty.jpg"
        );
        assert_eq!(
            uncertainty_file_name(Path::new("case/scan")).unwrap(),
            "scan-Uncertainty.jpg"
        );
    }

    #[test]
    fn output_folder_uses_parent_name() {
        let processor = PostProcessConfig::new("/results".to_string()).init();
        assert_eq!(
            processor
                .output_folder(Path::new("/data/patient_07/slice_3.png"))
                .unwrap(),
            PathBuf::from("/results/patient_07")
        );
        assert!(matches!(
            processor.output_folder(Path::new("slice_3.png")),
            Err(PostProcessError::InvalidPath { .. })
        ));
    }

    #[test]
    fn composite_normalizes_to_own_maximum() {
        let processor = PostProcessConfig::new(String::new()).init();
        let pixels = processor.composite(&[0.0, 51.0], &[0, 1], None);
        // Brightest value is 51 + 255 in the blue channel of pixel 1.
        assert_eq!(pixels.len(), 6);
        assert_eq!(&pixels[..3], &[0, 0, 0]);
        assert_eq!(pixels[5], 255);
        assert_eq!(pixels[3], (51.0f32 / 306.0 * 255.0).round() as u8);

        let dark = processor.composite(&[0.0; 4], &[0; 4], None);
        assert!(dark.iter().all(|&v| v == 0));
    }

    #[test]
    fn composite_can_paint_uncertainty_green() {
        let processor = PostProcessConfig::new(String::new())
            .with_overlay_channel(OverlayChannel::Red)
            .init();
        let pixels = processor.composite(&[0.0, 0.0], &[1, 0], Some(&[false, true]));
        assert_eq!(&pixels[..3], &[255, 0, 0]);
        assert_eq!(&pixels[3..], &[0, 165, 0]);
    }

    #[test]
    fn return_mode_yields_cleaned_labels() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::zeros([1, 1, 8, 8], &device);
        let mut mask = [[0i64; 8]; 8];
        mask[0][0] = 1;
        let predictions = Tensor::<TestBackend, 3, Int>::from_data([mask], &device);

        let processor = PostProcessConfig::new(String::new())
            .with_kernel_size(3)
            .init();
        let outcome = processor
            .process(
                PostProcessInput::new(images, predictions.into()),
                OutputMode::Return,
            )
            .unwrap();

        let PostProcessOutcome::LabelMaps(labels) = outcome else {
            panic!("expected label maps");
        };
        assert_eq!(labels.dims(), [1, 8, 8]);
        let values: Vec<i64> = labels.into_data().iter::<i64>().collect();
        assert!(values.iter().all(|&v| v == 0));
    }

    #[test]
    fn mismatched_batches_are_rejected() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 4], &device);
        let predictions = Tensor::<TestBackend, 4>::zeros([1, 2, 4, 4], &device);
        let processor = PostProcessConfig::new(String::new()).init();

        let result = processor.process(
            PostProcessInput::new(images.clone(), predictions.into()),
            OutputMode::Return,
        );
        assert!(matches!(
            result,
            Err(PostProcessError::BatchMismatch {
                what: "predictions",
                ..
            })
        ));

        let predictions = Tensor::<TestBackend, 4>::zeros([2, 2, 4, 4], &device);
        let result = processor.process(
            PostProcessInput::new(images, predictions.into()),
            OutputMode::Save {
                paths: vec![PathBuf::from("a/1.png")],
            },
        );
        assert!(matches!(
            result,
            Err(PostProcessError::BatchMismatch {
                what: "output paths",
                ..
            })
        ));
    }
}
