//! Shared building blocks for the medseg post-processing and evaluation
//! pipeline: explicit label encodings, morphological cleanup, image I/O,
//! training checkpoints and a console progress bar.

pub mod checkpoint;
pub mod image;
pub mod label;
pub mod morphology;
pub mod progress;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointRecord, ResumeState};
pub use label::{Encoding, LabelError, LabelMaps, SegmentationBatch};
pub use morphology::{clean_label_maps, MorphologyError, StructuringElement, DEFAULT_KERNEL_SIZE};
pub use progress::{format_duration, ProgressBar};
