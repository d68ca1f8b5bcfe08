//! Fully connected CRF over a pixel grid with mean-field inference.

use crate::{
    potential::{KernelNormalization, PairwiseKernel, PairwisePotential},
    CrfError, CrfResult,
};

/// Dense CRF with Potts pairwise terms.
///
/// Energies are stored point-major (`pixel * labels + label`), with pixels in
/// row-major order. [`set_unary_energy`](Self::set_unary_energy) and
/// [`inference`](Self::inference) use the label-major layout instead, one
/// full image per label.
#[derive(Debug, Clone)]
pub struct DenseCrf {
    width: usize,
    height: usize,
    labels: usize,
    unary: Option<Vec<f32>>,
    pairwise: Vec<PairwisePotential>,
}

impl DenseCrf {
    /// # Errors
    ///
    /// Returns [`CrfError::EmptyGrid`] if any dimension is zero.
    pub fn new(width: usize, height: usize, labels: usize) -> CrfResult<Self> {
        if width == 0 || height == 0 || labels == 0 {
            return Err(CrfError::EmptyGrid {
                width,
                height,
                labels,
            });
        }
        Ok(Self {
            width,
            height,
            labels,
            unary: None,
            pairwise: Vec::new(),
        })
    }

    pub fn pixels(&self) -> usize {
        self.width * self.height
    }

    pub fn labels(&self) -> usize {
        self.labels
    }

    /// Sets the unary energy from a label-major `[labels, height * width]` buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CrfError::ValueLength`] on a length mismatch.
    pub fn set_unary_energy(&mut self, unary: &[f32]) -> CrfResult<()> {
        let pixels = self.pixels();
        let expected = pixels * self.labels;
        if unary.len() != expected {
            return Err(CrfError::ValueLength {
                expected,
                actual: unary.len(),
            });
        }

        let mut energy = vec![0f32; expected];
        for (label, plane) in unary.chunks_exact(pixels).enumerate() {
            for (pixel, value) in plane.iter().enumerate() {
                energy[pixel * self.labels + label] = *value;
            }
        }
        self.unary = Some(energy);
        Ok(())
    }

    /// Adds a Potts term over arbitrary point-major per-pixel features.
    ///
    /// # Errors
    ///
    /// Returns [`CrfError::FeatureLength`] unless there are exactly `dim`
    /// features for every pixel.
    pub fn add_pairwise_energy(
        &mut self,
        features: &[f32],
        dim: usize,
        compat: f32,
        normalization: KernelNormalization,
    ) -> CrfResult<()> {
        if dim == 0 || features.len() != self.pixels() * dim {
            return Err(CrfError::FeatureLength {
                len: features.len(),
                dim,
            });
        }
        let kernel = PairwiseKernel::new(features, dim, normalization)?;
        self.pairwise.push(PairwisePotential::new(kernel, compat));
        Ok(())
    }

    /// Smoothness term on pixel position only, with features `(y / sy, x / sx)`.
    ///
    /// # Errors
    ///
    /// Propagates lattice construction errors.
    pub fn add_pairwise_gaussian(
        &mut self,
        sx: f32,
        sy: f32,
        compat: f32,
        normalization: KernelNormalization,
    ) -> CrfResult<()> {
        let mut features = Vec::with_capacity(self.pixels() * 2);
        for y in 0..self.height {
            for x in 0..self.width {
                features.push(y as f32 / sy);
                features.push(x as f32 / sx);
            }
        }
        self.add_pairwise_energy(&features, 2, compat, normalization)
    }

    /// Appearance term on position and colour, with features
    /// `(y / sy, x / sx, c_0 / s_0, …)`. `image` is pixel-major with one value
    /// per entry of `s_channels`.
    ///
    /// # Errors
    ///
    /// Returns [`CrfError::ImageLength`] if `image` does not hold
    /// `s_channels.len()` values per pixel.
    pub fn add_pairwise_bilateral(
        &mut self,
        sx: f32,
        sy: f32,
        s_channels: &[f32],
        image: &[f32],
        compat: f32,
        normalization: KernelNormalization,
    ) -> CrfResult<()> {
        let channels = s_channels.len();
        let expected = self.pixels() * channels;
        if channels == 0 || image.len() != expected {
            return Err(CrfError::ImageLength {
                expected,
                actual: image.len(),
            });
        }

        let dim = 2 + channels;
        let mut features = Vec::with_capacity(self.pixels() * dim);
        let mut pixels = image.chunks_exact(channels);
        for y in 0..self.height {
            for x in 0..self.width {
                features.push(y as f32 / sy);
                features.push(x as f32 / sx);
                if let Some(colour) = pixels.next() {
                    features.extend(colour.iter().zip(s_channels).map(|(c, s)| c / s));
                }
            }
        }
        self.add_pairwise_energy(&features, dim, compat, normalization)
    }

    /// Runs `iterations` mean-field updates and returns the label-major
    /// marginals `Q`, shape `[labels, height * width]`.
    ///
    /// # Errors
    ///
    /// Returns [`CrfError::MissingUnary`] if no unary energy was set.
    pub fn inference(&self, iterations: usize) -> CrfResult<Vec<f32>> {
        let q = self.run(iterations)?;
        let pixels = self.pixels();
        let mut label_major = vec![0f32; q.len()];
        for (pixel, marginals) in q.chunks_exact(self.labels).enumerate() {
            for (label, value) in marginals.iter().enumerate() {
                label_major[label * pixels + pixel] = *value;
            }
        }
        Ok(label_major)
    }

    /// Most likely label per pixel after `iterations` mean-field updates.
    ///
    /// # Errors
    ///
    /// Returns [`CrfError::MissingUnary`] if no unary energy was set.
    pub fn map(&self, iterations: usize) -> CrfResult<Vec<usize>> {
        let q = self.run(iterations)?;
        Ok(q.chunks_exact(self.labels)
            .map(|marginals| {
                marginals
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (label, &p)| {
                        if p > best.1 {
                            (label, p)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect())
    }

    fn run(&self, iterations: usize) -> CrfResult<Vec<f32>> {
        let unary = self.unary.as_ref().ok_or(CrfError::MissingUnary)?;

        let mut energy: Vec<f32> = unary.iter().map(|u| -u).collect();
        let mut q = energy.clone();
        exp_and_normalize(&mut q, self.labels);

        for iteration in 0..iterations {
            energy.iter_mut().zip(unary).for_each(|(e, u)| *e = -u);
            for potential in &self.pairwise {
                potential.add_message(&q, self.labels, &mut energy)?;
            }
            q.copy_from_slice(&energy);
            exp_and_normalize(&mut q, self.labels);
            tracing::trace!(iteration, "mean-field step");
        }

        Ok(q)
    }
}

/// Softmax over each point's `labels` values, in place.
fn exp_and_normalize(values: &mut [f32], labels: usize) {
    for point in values.chunks_exact_mut(labels) {
        let max = point.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut total = 0.0;
        for v in point.iter_mut() {
            *v = (*v - max).exp();
            total += *v;
        }
        point.iter_mut().for_each(|v| *v /= total);
    }
}
