//! `medseg`: post-processing and evaluation harness for binary medical image
//! segmentation.
//!
//! This crate ties the workspace together behind one backend selection and
//! one configuration file, and provides the drivers used by the `medseg`
//! binary.

pub mod backend;
pub mod commands;
pub mod config;
pub mod evaluate;
pub mod logging;
pub mod model;

pub use backend::{
    create_device, get_backend_name, SelectedBackend, SelectedDevice, TrainingBackend,
};
pub use config::{HarnessConfig, LoggingConfig};
pub use logging::{init_logging, LoggingError, LoggingGuard};
#[doc(inline)]
pub use medseg_crf as crf;
#[doc(inline)]
pub use medseg_inference as inference;
#[doc(inline)]
pub use medseg_metric as metric;
#[doc(inline)]
pub use medseg_util as util;
pub use model::{checkpoint_path, restore_checkpoint, MedsegError, ModelVariant, RunMode};
