pub mod postprocessing;

pub use postprocessing::*;
