//! Single-file operations behind the `refine` and `clean` subcommands.

use std::path::Path;

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Int, Tensor};
use medseg_crf::CrfConfig;
use medseg_util::{
    clean_label_maps,
    image::{labels_to_pixels, load_binary_mask, load_grayscale, save_gray},
    LabelMaps,
};

/// Refines a foreground probability image against its grayscale source with
/// a dense CRF and writes the 0/255 mask to `output`.
///
/// # Errors
///
/// Fails when an image cannot be read or written or the two inputs differ in
/// size.
pub fn refine_file<B: Backend>(
    image: &Path,
    probability: &Path,
    output: &Path,
    config: &CrfConfig,
    device: &B::Device,
) -> Result<()> {
    let source = load_grayscale::<B, _>(image, device)?;
    let foreground = load_grayscale::<B, _>(probability, device)?;
    let background = foreground.clone().neg().add_scalar(1.0);
    let probabilities = Tensor::cat(vec![background, foreground], 1);

    let labels = config
        .init()
        .refine_batch(source, probabilities)
        .with_context(|| {
            format!(
                "failed to refine {} with {}",
                image.display(),
                probability.display()
            )
        })?;
    write_mask(labels, output)?;

    tracing::info!(output = %output.display(), "refined mask written");
    Ok(())
}

/// Opens then closes the mask at `input` with a square element and writes the
/// 0/255 result to `output`.
///
/// # Errors
///
/// Fails on unreadable input, a zero kernel size or a failed write.
pub fn clean_file<B: Backend>(
    input: &Path,
    output: &Path,
    kernel_size: usize,
    device: &B::Device,
) -> Result<()> {
    let mask = load_binary_mask::<B, _>(input, device)?;
    let cleaned = clean_label_maps(mask, kernel_size)?;
    write_mask(cleaned, output)?;

    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        kernel_size,
        "cleaned mask written"
    );
    Ok(())
}

fn write_mask<B: Backend>(labels: Tensor<B, 3, Int>, output: &Path) -> Result<()> {
    let maps = LabelMaps::from_tensor(labels);
    let [_, height, width] = maps.shape();
    save_gray(output, width, height, labels_to_pixels(maps.sample(0), 255))?;
    Ok(())
}
