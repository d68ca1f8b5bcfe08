//! Training checkpoints: model and optimizer state plus epoch bookkeeping.
//!
//! A checkpoint is a single MessagePack file holding the model record, the
//! optimizer record (when one was attached), the epoch and the best
//! validation score seen so far. Saving overwrites the file in place; a crash
//! during the write leaves a corrupt file behind.

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
};

use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, PrecisionSettings, Record, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File extension written by the checkpoint recorder.
pub const CHECKPOINT_EXTENSION: &str = "mpk";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found at '{path}'")]
    NotFound { path: PathBuf },

    #[error("failed to {action} checkpoint '{path}': {reason}")]
    Recorder {
        action: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("checkpoint '{path}' has no optimizer state but an optimizer is attached")]
    MissingOptimizerState { path: PathBuf },
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Everything persisted in one checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointRecord<M, O> {
    pub model: M,
    pub optimizer: Option<O>,
    pub epoch: usize,
    pub best_score: f64,
}

/// Serialized form of [`CheckpointRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecordItem<M, O> {
    pub model_state: M,
    pub optimizer_state: Option<O>,
    pub epoch: usize,
    pub best_score: f64,
}

impl<B, M, O> Record<B> for CheckpointRecord<M, O>
where
    B: Backend,
    M: Record<B>,
    O: Record<B>,
{
    type Item<S: PrecisionSettings> =
        CheckpointRecordItem<<M as Record<B>>::Item<S>, <O as Record<B>>::Item<S>>;

    fn into_item<S: PrecisionSettings>(self) -> Self::Item<S> {
        CheckpointRecordItem {
            model_state: <M as Record<B>>::into_item::<S>(self.model),
            optimizer_state: self
                .optimizer
                .map(|optimizer| <O as Record<B>>::into_item::<S>(optimizer)),
            epoch: self.epoch,
            best_score: self.best_score,
        }
    }

    fn from_item<S: PrecisionSettings>(item: Self::Item<S>, device: &B::Device) -> Self {
        Self {
            model: <M as Record<B>>::from_item::<S>(item.model_state, device),
            optimizer: item
                .optimizer_state
                .map(|state| <O as Record<B>>::from_item::<S>(state, device)),
            epoch: item.epoch,
            best_score: item.best_score,
        }
    }
}

/// Resolves the on-disk location of a checkpoint: the recorder always writes
/// with the `.mpk` extension, replacing any extension already on `path`.
pub fn resolve_checkpoint_path(path: &Path) -> PathBuf {
    path.with_extension(CHECKPOINT_EXTENSION)
}

/// A model, its optional optimizer, and training progress.
pub struct Checkpoint<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    pub model: M,
    pub optimizer: Option<O>,
    pub epoch: usize,
    pub best_score: f64,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B, M, O> Checkpoint<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    /// New checkpoint at epoch 0 with a best score of 1.
    pub fn new(model: M, optimizer: Option<O>, device: &B::Device) -> Self {
        Self {
            model,
            optimizer,
            epoch: 0,
            best_score: 1.0,
            device: device.clone(),
            _backend: PhantomData,
        }
    }

    pub fn with_progress(mut self, epoch: usize, best_score: f64) -> Self {
        self.epoch = epoch;
        self.best_score = best_score;
        self
    }

    /// Restores model parameters, epoch and best score from `path`, and the
    /// optimizer state when an optimizer is attached.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] for a missing file,
    /// [`CheckpointError::Recorder`] for a malformed one, and
    /// [`CheckpointError::MissingOptimizerState`] when an optimizer is
    /// attached but the file carries no optimizer state. Nothing is modified
    /// on error.
    pub fn load(&mut self, path: impl AsRef<Path>) -> CheckpointResult<()> {
        let file = resolve_checkpoint_path(path.as_ref());
        if !file.exists() {
            return Err(CheckpointError::NotFound { path: file });
        }

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let record: CheckpointRecord<M::Record, O::Record> =
            Recorder::<B>::load(&recorder, file.clone(), &self.device).map_err(|e| {
                CheckpointError::Recorder {
                    action: "load",
                    path: file.clone(),
                    reason: e.to_string(),
                }
            })?;

        if self.optimizer.is_some() && record.optimizer.is_none() {
            return Err(CheckpointError::MissingOptimizerState { path: file });
        }

        self.model = self.model.clone().load_record(record.model);
        if let (Some(optimizer), Some(state)) = (self.optimizer.take(), record.optimizer) {
            self.optimizer = Some(optimizer.load_record(state));
        }
        self.epoch = record.epoch;
        self.best_score = record.best_score;

        tracing::info!(
            path = %file.display(),
            epoch = self.epoch,
            best_score = self.best_score,
            "checkpoint loaded"
        );
        Ok(())
    }

    /// Writes model parameters, optimizer state, epoch and best score to
    /// `path`, overwriting any existing checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Recorder`] if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> CheckpointResult<PathBuf> {
        let file = resolve_checkpoint_path(path.as_ref());
        let record = CheckpointRecord {
            model: self.model.clone().into_record(),
            optimizer: self.optimizer.as_ref().map(|optimizer| optimizer.to_record()),
            epoch: self.epoch,
            best_score: self.best_score,
        };

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        Recorder::<B>::record(&recorder, record, file.clone()).map_err(|e| {
            CheckpointError::Recorder {
                action: "save",
                path: file.clone(),
                reason: e.to_string(),
            }
        })?;

        tracing::info!(
            path = %file.display(),
            epoch = self.epoch,
            best_score = self.best_score,
            "checkpoint saved"
        );
        Ok(file)
    }
}

/// Where training starts from, either fresh or resumed from a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResumeState {
    pub start_epoch: usize,
    pub best_score: f64,
}

impl ResumeState {
    /// Starting point without a checkpoint.
    pub const fn fresh() -> Self {
        Self {
            start_epoch: 1,
            best_score: 0.0,
        }
    }

    /// Continues with the epoch after the one stored in `checkpoint`.
    pub fn from_checkpoint<B, M, O>(checkpoint: &Checkpoint<B, M, O>) -> Self
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        Self {
            start_epoch: checkpoint.epoch + 1,
            best_score: checkpoint.best_score,
        }
    }
}

impl Default for ResumeState {
    fn default() -> Self {
        Self::fresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_path_uses_recorder_extension() {
        assert_eq!(
            resolve_checkpoint_path(Path::new("ckpt/unet.tar")),
            PathBuf::from("ckpt/unet.mpk")
        );
        assert_eq!(
            resolve_checkpoint_path(Path::new("ckpt/deeplab")),
            PathBuf::from("ckpt/deeplab.mpk")
        );
    }

    #[test]
    fn fresh_resume_state_starts_at_epoch_one() {
        let state = ResumeState::fresh();
        assert_eq!(state.start_epoch, 1);
        assert_eq!(state.best_score, 0.0);
    }
}
