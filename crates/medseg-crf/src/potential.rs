//! Pairwise potentials: a Gaussian kernel over feature space combined with a
//! Potts label compatibility.

use serde::{Deserialize, Serialize};

use crate::{lattice::PermutohedralLattice, CrfResult};

/// How a kernel rescales its filter response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum KernelNormalization {
    /// A single global factor so the mean response to ones is 1.
    None,
    /// `1 / sqrt(norm)` applied before and after filtering.
    #[default]
    Symmetric,
    /// `1 / norm` applied before filtering.
    Before,
    /// `1 / norm` applied after filtering.
    After,
}

/// Gaussian kernel over a fixed set of per-pixel features.
#[derive(Debug, Clone)]
pub struct PairwiseKernel {
    lattice: PermutohedralLattice,
    normalization: KernelNormalization,
    norm: Vec<f32>,
}

impl PairwiseKernel {
    /// # Errors
    ///
    /// Propagates lattice construction errors.
    pub fn new(
        features: &[f32],
        dim: usize,
        normalization: KernelNormalization,
    ) -> CrfResult<Self> {
        let lattice = PermutohedralLattice::new(features, dim)?;
        let points = lattice.points();
        let mut norm = lattice.compute(&vec![1.0; points], 1, false)?;

        match normalization {
            KernelNormalization::None => {
                let total: f32 = norm.iter().sum();
                let mean = points as f32 / total;
                norm.iter_mut().for_each(|n| *n = mean);
            }
            KernelNormalization::Symmetric => {
                norm.iter_mut().for_each(|n| *n = 1.0 / (*n + 1e-20).sqrt());
            }
            KernelNormalization::Before | KernelNormalization::After => {
                norm.iter_mut().for_each(|n| *n = 1.0 / (*n + 1e-20));
            }
        }

        Ok(Self {
            lattice,
            normalization,
            norm,
        })
    }

    pub fn normalization(&self) -> KernelNormalization {
        self.normalization
    }

    /// Filters point-major `values`. `transpose` applies `Kᵀ`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CrfError::ValueLength`] on a length mismatch.
    pub fn apply(&self, values: &[f32], value_size: usize, transpose: bool) -> CrfResult<Vec<f32>> {
        let scale_before = matches!(
            (self.normalization, transpose),
            (KernelNormalization::Symmetric, _)
                | (KernelNormalization::Before, false)
                | (KernelNormalization::After, true)
        );
        let scale_after = matches!(
            (self.normalization, transpose),
            (KernelNormalization::Symmetric, _)
                | (KernelNormalization::Before, true)
                | (KernelNormalization::After, false)
                | (KernelNormalization::None, _)
        );

        let mut input = values.to_vec();
        if scale_before {
            self.scale(&mut input, value_size);
        }
        let mut output = self.lattice.compute(&input, value_size, transpose)?;
        if scale_after {
            self.scale(&mut output, value_size);
        }
        Ok(output)
    }

    fn scale(&self, values: &mut [f32], value_size: usize) {
        for (chunk, n) in values.chunks_exact_mut(value_size).zip(&self.norm) {
            chunk.iter_mut().for_each(|v| *v *= n);
        }
    }
}

/// Kernel plus Potts compatibility with weight `w`.
#[derive(Debug, Clone)]
pub struct PairwisePotential {
    kernel: PairwiseKernel,
    weight: f32,
}

impl PairwisePotential {
    pub fn new(kernel: PairwiseKernel, weight: f32) -> Self {
        Self { kernel, weight }
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Adds `w·K(Q)` to `energy`, both point-major with `labels` values per point.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CrfError::ValueLength`] on a length mismatch.
    pub fn add_message(&self, q: &[f32], labels: usize, energy: &mut [f32]) -> CrfResult<()> {
        let filtered = self.kernel.apply(q, labels, false)?;
        for (e, f) in energy.iter_mut().zip(&filtered) {
            *e += self.weight * f;
        }
        Ok(())
    }
}
