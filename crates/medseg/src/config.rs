//! Harness configuration, stored as JSON through Burn's [`Config`] trait.

use burn::prelude::*;
use medseg_crf::CrfConfig;
use medseg_inference::PostProcessConfig;

/// Console and rolling-file log output.
#[derive(Config, Debug)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[config(default = "\"info\".to_string()")]
    pub level: String,
    /// Folder for the daily log file; `None` turns file output off.
    #[config(default = "Some(\".\".to_string())")]
    pub directory: Option<String>,
    #[config(default = "\"result.log\".to_string()")]
    pub file_name: String,
    #[config(default = true)]
    pub console: bool,
}

impl LoggingConfig {
    /// Folder and base name of the rotating log file, if file output is on.
    pub fn file_output(&self) -> Option<(&str, &str)> {
        self.directory
            .as_deref()
            .map(|directory| (directory, self.file_name.as_str()))
    }
}

/// Everything the `medseg` binary reads from `--config`.
#[derive(Config, Debug)]
pub struct HarnessConfig {
    #[config(default = "LoggingConfig::new()")]
    pub logging: LoggingConfig,
    #[config(default = "PostProcessConfig::new(\"results\".to_string())")]
    pub post_process: PostProcessConfig,
    #[config(default = "CrfConfig::new()")]
    pub crf: CrfConfig,
    /// Folder holding one checkpoint per model variant.
    #[config(default = "\"checkpoints\".to_string()")]
    pub checkpoint_dir: String,
    /// Model variant name, see [`crate::ModelVariant`].
    #[config(default = "\"unet\".to_string()")]
    pub model: String,
    /// Clean predicted masks before scoring them.
    #[config(default = false)]
    pub eval_erode: bool,
    #[config(default = 7)]
    pub eval_kernel_size: usize,
}
