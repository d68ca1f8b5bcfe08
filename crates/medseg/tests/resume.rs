use burn::{
    nn::{Linear, LinearConfig},
    optim::{AdamConfig, Optimizer},
    tensor::backend::Backend,
};
use medseg::{
    checkpoint_path, restore_checkpoint, MedsegError, ModelVariant, RunMode, TrainingBackend,
};
use medseg_util::{Checkpoint, CheckpointError};

type TestBackend = TrainingBackend;
type Device = <TestBackend as Backend>::Device;
type Model = Linear<TestBackend>;

fn fresh_checkpoint(
    device: &Device,
) -> Checkpoint<TestBackend, Model, impl Optimizer<Model, TestBackend>> {
    let optimizer = AdamConfig::new().init::<TestBackend, Model>();
    Checkpoint::new(
        LinearConfig::new(3, 2).init(device),
        Some(optimizer),
        device,
    )
}

#[test]
fn fresh_training_ignores_checkpoint_folder() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let mut checkpoint = fresh_checkpoint(&device);

    let state = restore_checkpoint(
        &mut checkpoint,
        dir.path(),
        ModelVariant::UNet,
        RunMode::Train { resume: false },
    )
    .unwrap();
    assert_eq!(state.start_epoch, 1);
    assert_eq!(state.best_score, 0.0);
    assert_eq!(checkpoint.epoch, 0);
}

#[test]
fn test_mode_resumes_from_variant_checkpoint() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();

    let saved = fresh_checkpoint(&device).with_progress(12, 0.91);
    let file = saved
        .save(dir.path().join(ModelVariant::PspNetRes50.name()))
        .unwrap();
    assert_eq!(file, checkpoint_path(dir.path(), ModelVariant::PspNetRes50));

    let mut checkpoint = fresh_checkpoint(&device);
    let state = restore_checkpoint(
        &mut checkpoint,
        dir.path(),
        ModelVariant::PspNetRes50,
        RunMode::Test,
    )
    .unwrap();
    assert_eq!(state.start_epoch, 13);
    assert_eq!(state.best_score, 0.91);
}

#[test]
fn resuming_without_checkpoint_fails() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let mut checkpoint = fresh_checkpoint(&device);

    let result = restore_checkpoint(
        &mut checkpoint,
        dir.path(),
        ModelVariant::DeepLab,
        RunMode::Train { resume: true },
    );
    assert!(matches!(
        result,
        Err(MedsegError::Checkpoint(CheckpointError::NotFound { .. }))
    ));
}
