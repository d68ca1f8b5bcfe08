//! Model variants and checkpoint resumption.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use burn::{module::AutodiffModule, optim::Optimizer, tensor::backend::AutodiffBackend};
use medseg_util::{checkpoint::resolve_checkpoint_path, Checkpoint, CheckpointError, ResumeState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MedsegError {
    #[error("unknown model variant '{0}', expected one of unet, pspnet_res18, pspnet_res34, pspnet_res50, deeplab")]
    UnknownVariant(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Supported segmentation networks, named as on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    UNet,
    PspNetRes18,
    PspNetRes34,
    PspNetRes50,
    DeepLab,
}

impl ModelVariant {
    pub const ALL: [Self; 5] = [
        Self::UNet,
        Self::PspNetRes18,
        Self::PspNetRes34,
        Self::PspNetRes50,
        Self::DeepLab,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::UNet => "unet",
            Self::PspNetRes18 => "pspnet_res18",
            Self::PspNetRes34 => "pspnet_res34",
            Self::PspNetRes50 => "pspnet_res50",
            Self::DeepLab => "deeplab",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelVariant {
    type Err = MedsegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|variant| variant.name() == s)
            .ok_or_else(|| MedsegError::UnknownVariant(s.to_string()))
    }
}

/// Where the checkpoint of `variant` lives inside `dir`.
pub fn checkpoint_path(dir: impl AsRef<Path>, variant: ModelVariant) -> PathBuf {
    resolve_checkpoint_path(&dir.as_ref().join(variant.name()))
}

/// Why a model is being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Training resumes from the checkpoint only when asked to.
    Train { resume: bool },
    /// Evaluation always starts from the saved checkpoint.
    Test,
}

impl RunMode {
    pub const fn resumes(&self) -> bool {
        match self {
            Self::Train { resume } => *resume,
            Self::Test => true,
        }
    }
}

/// Loads the checkpoint of `variant` into `checkpoint` when `mode` resumes,
/// and reports where training continues from.
///
/// # Errors
///
/// Propagates [`CheckpointError`] from loading.
pub fn restore_checkpoint<B, M, O>(
    checkpoint: &mut Checkpoint<B, M, O>,
    dir: impl AsRef<Path>,
    variant: ModelVariant,
    mode: RunMode,
) -> Result<ResumeState, MedsegError>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    if !mode.resumes() {
        tracing::info!(model = %variant, "starting without a checkpoint");
        return Ok(ResumeState::fresh());
    }

    checkpoint.load(checkpoint_path(dir, variant))?;
    let state = ResumeState::from_checkpoint(checkpoint);
    tracing::info!(
        model = %variant,
        start_epoch = state.start_epoch,
        best_score = state.best_score,
        "resuming from checkpoint"
    );
    Ok(state)
}
