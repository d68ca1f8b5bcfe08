use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::config::Config;
use clap::{Parser, Subcommand};
use medseg::{
    commands::{clean_file, refine_file},
    create_device,
    evaluate::{evaluate_directories, EvaluateOptions},
    get_backend_name, init_logging, HarnessConfig, ModelVariant, SelectedBackend,
};

#[derive(Parser)]
#[command(name = "medseg")]
#[command(about = "Post-processing and evaluation for binary medical image segmentation")]
struct Cli {
    /// Harness configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score predicted masks against reference masks
    Evaluate {
        /// Folder of predicted masks
        #[arg(short, long)]
        predictions: PathBuf,

        /// Folder of reference masks with the same relative paths
        #[arg(short, long)]
        targets: PathBuf,

        /// Clean predictions with an opening and closing first
        #[arg(long)]
        erode: bool,

        /// Side of the square structuring element
        #[arg(short, long)]
        kernel_size: Option<usize>,

        /// Also write the scores as JSON
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Refine a foreground probability image with a dense CRF
    Refine {
        /// Grayscale source image
        #[arg(short, long)]
        image: PathBuf,

        /// Foreground probability image, 255 meaning certain foreground
        #[arg(short, long)]
        probability: PathBuf,

        /// Where to write the refined 0/255 mask
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Remove specks and fill holes in a mask image
    Clean {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Side of the square structuring element
        #[arg(short, long)]
        kernel_size: Option<usize>,
    },

    /// Show backend information
    Info,
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    match path {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(HarnessConfig::new()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let _guard = init_logging(&config.logging)?;

    let device = create_device();
    tracing::info!(backend = get_backend_name(), "using backend");

    match cli.command {
        Commands::Evaluate {
            predictions,
            targets,
            erode,
            kernel_size,
            report: report_path,
        } => {
            let options = EvaluateOptions {
                erode: erode || config.eval_erode,
                kernel_size: kernel_size.unwrap_or(config.eval_kernel_size),
            };
            let report = evaluate_directories::<SelectedBackend, _>(
                &predictions,
                &targets,
                &options,
                &device,
                std::io::stdout(),
            )?;

            for score in &report.images {
                println!(
                    "{}: Dice {:.4}  IoU {:.4}  F1 {:.4}",
                    score.name.display(),
                    score.metrics.dice_score(),
                    score.metrics.iou,
                    score.metrics.f1
                );
            }
            for name in &report.unmatched {
                println!("{}: no reference mask", name.display());
            }
            println!(
                "Overall ({} images): Dice {:.4}  IoU {:.4}  F1 {:.4}",
                report.images.len(),
                report.overall.dice_score(),
                report.overall.iou,
                report.overall.f1
            );
            if let Some(path) = report_path {
                report.save_json(&path)?;
                tracing::info!(path = %path.display(), "report written");
            }
            Ok(())
        }

        Commands::Refine {
            image,
            probability,
            output,
        } => refine_file::<SelectedBackend>(&image, &probability, &output, &config.crf, &device),

        Commands::Clean {
            input,
            output,
            kernel_size,
        } => clean_file::<SelectedBackend>(
            &input,
            &output,
            kernel_size.unwrap_or(config.post_process.kernel_size),
            &device,
        ),

        Commands::Info => {
            let variant: ModelVariant = config.model.parse()?;
            println!("medseg Information:");
            println!("  Backend: {}", get_backend_name());
            println!("  Device: {device:?}");
            println!("  Model: {variant}");
            println!(
                "  Checkpoint: {}",
                medseg::checkpoint_path(&config.checkpoint_dir, variant).display()
            );
            Ok(())
        }
    }
}
