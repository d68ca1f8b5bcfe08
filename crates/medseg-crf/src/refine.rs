//! Batch refinement of softmax outputs with a dense CRF.

use burn::{
    config::Config,
    tensor::{backend::Backend, Int, Tensor, TensorData},
};

use crate::{dense::DenseCrf, potential::KernelNormalization, CrfError, CrfResult};

/// Kernel widths and weights of the refinement CRF.
#[derive(Config, Debug)]
pub struct CrfConfig {
    /// Spatial standard deviation of the smoothness kernel, in pixels.
    #[config(default = 10.0)]
    pub gaussian_sxy: f32,
    #[config(default = 3.0)]
    pub gaussian_compat: f32,
    /// Spatial standard deviation of the appearance kernel, in pixels.
    #[config(default = 50.0)]
    pub bilateral_sxy: f32,
    /// Colour standard deviation of the appearance kernel, per channel.
    #[config(default = 20.0)]
    pub bilateral_srgb: f32,
    #[config(default = 10.0)]
    pub bilateral_compat: f32,
    #[config(default = 5)]
    pub iterations: usize,
    #[config(default = 2)]
    pub labels: usize,
    /// Lower clamp on probabilities before taking the log.
    #[config(default = 1e-5)]
    pub unary_clip: f32,
    /// Factor taking `[0, 1]` intensities to the colour range of the kernel.
    #[config(default = 255.0)]
    pub intensity_scale: f32,
    #[config(default = "KernelNormalization::Symmetric")]
    pub normalization: KernelNormalization,
}

impl CrfConfig {
    pub fn init(&self) -> CrfRefiner {
        CrfRefiner {
            config: self.clone(),
        }
    }
}

/// `−ln(clamp(p, clip, 1))` for every probability.
pub fn unary_from_softmax(probabilities: &[f32], clip: f32) -> Vec<f32> {
    probabilities
        .iter()
        .map(|p| -p.clamp(clip, 1.0).ln())
        .collect()
}

/// Refines `[N, 2, H, W]` probabilities against `[N, 1|3, H, W]` images in
/// `[0, 1]` with the default [`CrfConfig`].
///
/// # Errors
///
/// See [`CrfRefiner::refine_batch`].
pub fn refine_batch<B: Backend>(
    images: Tensor<B, 4>,
    probabilities: Tensor<B, 4>,
) -> CrfResult<Tensor<B, 3, Int>> {
    CrfConfig::new().init().refine_batch(images, probabilities)
}

#[derive(Debug, Clone)]
pub struct CrfRefiner {
    config: CrfConfig,
}

impl CrfRefiner {
    pub fn config(&self) -> &CrfConfig {
        &self.config
    }

    /// Runs the CRF on every sample and returns the arg-max label maps `[N, H, W]`.
    ///
    /// Single-channel images are scaled by `intensity_scale` and replicated
    /// into three colour channels.
    ///
    /// # Errors
    ///
    /// - [`CrfError::EmptyBatch`] for a batch of zero samples.
    /// - [`CrfError::BatchMismatch`] if images and probabilities differ in `N`.
    /// - [`CrfError::ClassCount`] if the class axis is not `labels` wide.
    /// - [`CrfError::ImageChannels`] for anything but 1 or 3 image channels.
    /// - [`CrfError::SpatialMismatch`] if the `H × W` grids differ.
    pub fn refine_batch<B: Backend>(
        &self,
        images: Tensor<B, 4>,
        probabilities: Tensor<B, 4>,
    ) -> CrfResult<Tensor<B, 3, Int>> {
        let [n_images, channels, height, width] = images.dims();
        let [n_probs, classes, p_height, p_width] = probabilities.dims();

        if n_images == 0 || n_probs == 0 {
            return Err(CrfError::EmptyBatch);
        }
        if n_images != n_probs {
            return Err(CrfError::BatchMismatch {
                images: n_images,
                probabilities: n_probs,
            });
        }
        if classes != self.config.labels {
            return Err(CrfError::ClassCount {
                expected: self.config.labels,
                actual: classes,
            });
        }
        if channels != 1 && channels != 3 {
            return Err(CrfError::ImageChannels { actual: channels });
        }
        if [height, width] != [p_height, p_width] {
            return Err(CrfError::SpatialMismatch {
                image: [height, width],
                probabilities: [p_height, p_width],
            });
        }

        let device = probabilities.device();
        let image_values: Vec<f32> = images.into_data().iter::<f32>().collect();
        let prob_values: Vec<f32> = probabilities.into_data().iter::<f32>().collect();

        let pixels = height * width;
        let mut labels = Vec::with_capacity(n_images * pixels);
        for (sample, (image, probs)) in image_values
            .chunks_exact(channels * pixels)
            .zip(prob_values.chunks_exact(classes * pixels))
            .enumerate()
        {
            let rgb = self.colour_features(image, channels, pixels);
            let map = self.refine_sample(width, height, &rgb, probs)?;
            labels.extend(map.into_iter().map(|label| label as i64));
            tracing::trace!(sample, "crf sample refined");
        }

        tracing::debug!(
            samples = n_images,
            height,
            width,
            iterations = self.config.iterations,
            "crf refinement finished"
        );

        let data = TensorData::new(labels, [n_images, height, width]);
        Ok(Tensor::from_data(data, &device))
    }

    /// Refines one sample. `rgb` is pixel-major with three channels and
    /// `probabilities` is label-major.
    ///
    /// # Errors
    ///
    /// Propagates [`DenseCrf`] errors.
    pub fn refine_sample(
        &self,
        width: usize,
        height: usize,
        rgb: &[f32],
        probabilities: &[f32],
    ) -> CrfResult<Vec<usize>> {
        let config = &self.config;
        let mut crf = DenseCrf::new(width, height, config.labels)?;
        crf.set_unary_energy(&unary_from_softmax(probabilities, config.unary_clip))?;
        crf.add_pairwise_gaussian(
            config.gaussian_sxy,
            config.gaussian_sxy,
            config.gaussian_compat,
            config.normalization,
        )?;
        crf.add_pairwise_bilateral(
            config.bilateral_sxy,
            config.bilateral_sxy,
            &[config.bilateral_srgb; 3],
            rgb,
            config.bilateral_compat,
            config.normalization,
        )?;
        crf.map(config.iterations)
    }

    /// Channel-major `[C, H, W]` intensities to pixel-major RGB in the
    /// kernel's colour range.
    fn colour_features(&self, image: &[f32], channels: usize, pixels: usize) -> Vec<f32> {
        let scale = self.config.intensity_scale;
        let mut rgb = Vec::with_capacity(pixels * 3);
        for pixel in 0..pixels {
            for c in 0..3 {
                let source = if channels == 1 { 0 } else { c };
                rgb.push(image[source * pixels + pixel] * scale);
            }
        }
        rgb
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn unary_clamps_before_log() {
        let unary = unary_from_softmax(&[1.0, 0.0, 0.5, 2.0], 1e-5);
        assert_eq!(unary[0], 0.0);
        assert!((unary[1] - 1e-5f32.ln().abs()).abs() < 1e-3);
        assert!((unary[2] - 2f32.ln()).abs() < 1e-6);
        assert_eq!(unary[3], 0.0);
    }

    #[test]
    fn default_config_matches_design_constants() {
        let config = CrfConfig::new();
        assert_eq!(config.gaussian_sxy, 10.0);
        assert_eq!(config.gaussian_compat, 3.0);
        assert_eq!(config.bilateral_sxy, 50.0);
        assert_eq!(config.bilateral_srgb, 20.0);
        assert_eq!(config.bilateral_compat, 10.0);
        assert_eq!(config.iterations, 5);
        assert_eq!(config.labels, 2);
        assert_eq!(config.normalization, KernelNormalization::Symmetric);
    }

    #[test]
    fn grayscale_is_replicated_and_scaled() {
        let refiner = CrfConfig::new().init();
        let rgb = refiner.colour_features(&[0.0, 0.5, 1.0], 1, 3);
        assert_eq!(
            rgb,
            vec![0.0, 0.0, 0.0, 127.5, 127.5, 127.5, 255.0, 255.0, 255.0]
        );

        let rgb = refiner.colour_features(&[0.0, 1.0, 0.2, 0.4, 0.6, 0.8], 3, 2);
        assert_eq!(rgb.len(), 6);
        assert!((rgb[1] - 0.2 * 255.0).abs() < 1e-4);
        assert!((rgb[5] - 0.8 * 255.0).abs() < 1e-4);
    }

    #[test]
    fn validates_batch_shapes() {
        let device = Default::default();
        let refiner = CrfConfig::new().init();
        let images = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 4], &device);

        let probs = Tensor::<TestBackend, 4>::zeros([1, 2, 4, 4], &device);
        assert!(matches!(
            refiner.refine_batch(images.clone(), probs),
            Err(CrfError::BatchMismatch {
                images: 2,
                probabilities: 1,
            })
        ));

        let probs = Tensor::<TestBackend, 4>::zeros([2, 3, 4, 4], &device);
        assert!(matches!(
            refiner.refine_batch(images.clone(), probs),
            Err(CrfError::ClassCount {
                expected: 2,
                actual: 3,
            })
        ));

        let probs = Tensor::<TestBackend, 4>::zeros([2, 2, 4, 5], &device);
        assert!(matches!(
            refiner.refine_batch(images.clone(), probs),
            Err(CrfError::SpatialMismatch { .. })
        ));

        let probs = Tensor::<TestBackend, 4>::zeros([2, 2, 4, 4], &device);
        let two_channel = Tensor::<TestBackend, 4>::zeros([2, 2, 4, 4], &device);
        assert!(matches!(
            refiner.refine_batch(two_channel, probs),
            Err(CrfError::ImageChannels { actual: 2 })
        ));
    }

    #[test]
    fn empty_batch_is_rejected() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::zeros([0, 1, 4, 4], &device);
        let probs = Tensor::<TestBackend, 4>::zeros([0, 2, 4, 4], &device);
        assert!(matches!(
            refine_batch(images, probs),
            Err(CrfError::EmptyBatch)
        ));
    }
}
