//! # medseg CRF
//!
//! Dense conditional random field refinement for two-class segmentation.
//!
//! Each pixel is a node connected to every other pixel. Pairwise terms are
//! Gaussian kernels evaluated with a [`PermutohedralLattice`], so one
//! mean-field step is linear in the number of pixels:
//!
//! - a smoothness kernel on pixel position,
//! - an appearance kernel on position and colour.
//!
//! [`CrfRefiner::refine_batch`] wraps the whole procedure for `[N, 2, H, W]`
//! softmax outputs and their source images.

pub mod dense;
pub mod lattice;
pub mod potential;
pub mod refine;

pub use dense::DenseCrf;
pub use lattice::PermutohedralLattice;
pub use potential::{KernelNormalization, PairwiseKernel, PairwisePotential};
pub use refine::{refine_batch, unary_from_softmax, CrfConfig, CrfRefiner};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrfError {
    #[error("{len} feature values cannot be split into points of dimension {dim}")]
    FeatureLength { len: usize, dim: usize },

    #[error("expected {expected} values, got {actual}")]
    ValueLength { expected: usize, actual: usize },

    #[error("expected {expected} image values, got {actual}")]
    ImageLength { expected: usize, actual: usize },

    #[error("CRF grid must be non-empty, got {width}x{height} with {labels} labels")]
    EmptyGrid {
        width: usize,
        height: usize,
        labels: usize,
    },

    #[error("unary energy must be set before inference")]
    MissingUnary,

    #[error("expected {expected} classes on axis 1, got {actual}")]
    ClassCount { expected: usize, actual: usize },

    #[error("images must have 1 or 3 channels, got {actual}")]
    ImageChannels { actual: usize },

    #[error("image grid {image:?} does not match probability grid {probabilities:?}")]
    SpatialMismatch {
        image: [usize; 2],
        probabilities: [usize; 2],
    },

    #[error("batch size mismatch: {images} images, {probabilities} probability maps")]
    BatchMismatch { images: usize, probabilities: usize },

    #[error("cannot refine an empty batch")]
    EmptyBatch,
}

pub type CrfResult<T> = Result<T, CrfError>;
