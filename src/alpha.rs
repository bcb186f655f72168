use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use image::RgbaImage;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::cancel::CancelFlag;

fn load(frame: &Path) -> anyhow::Result<RgbaImage> {
    Ok(image::open(frame)
        .with_context(|| format!("Unable to open frame {frame:?}"))?
        .into_rgba8())
}

/// Whether the first frame has any pixel that is not fully opaque.
pub fn has_transparency(frames: &[PathBuf]) -> anyhow::Result<bool> {
    let Some(first) = frames.first() else {
        return Ok(false);
    };

    Ok(load(first)?.pixels().any(|pixel| pixel.0[3] < u8::MAX))
}

/// Prepares the transparency of a frame sequence for encoding. Returns whether any frame was
/// rewritten.
///
/// Without `preserve_animated` the first frame's alpha channel is copied onto every other frame
/// so the whole animation shares one mask. With it, each frame's alpha is carried over from a
/// running mask that only takes the pixels whose alpha actually changed.
pub fn apply(
    frames: &[PathBuf],
    preserve_animated: bool,
    cancel: &CancelFlag,
) -> anyhow::Result<bool> {
    if preserve_animated {
        apply_deltas(frames, cancel)
    } else {
        apply_first_mask(frames, cancel)
    }
}

fn check_dimensions(frame: &Path, image: &RgbaImage, reference: (u32, u32)) -> anyhow::Result<()> {
    if image.dimensions() == reference {
        Ok(())
    } else {
        Err(anyhow!(
            "Frame {frame:?} is {:?} but the first frame is {reference:?}",
            image.dimensions()
        ))
    }
}

fn apply_first_mask(frames: &[PathBuf], cancel: &CancelFlag) -> anyhow::Result<bool> {
    let Some((first, rest)) = frames.split_first() else {
        return Ok(false);
    };

    let mask = load(first)?;

    if mask.pixels().all(|pixel| pixel.0[3] == u8::MAX) {
        return Ok(false);
    }

    info!("Applying the first frame's transparency to {} frames", rest.len());

    rest.par_iter().try_for_each(|frame| -> anyhow::Result<()> {
        cancel.check()?;

        let mut image = load(frame)?;
        check_dimensions(frame, &image, mask.dimensions())?;

        for (pixel, mask_pixel) in image.pixels_mut().zip(mask.pixels()) {
            pixel.0[3] = mask_pixel.0[3];
        }

        image
            .save(frame)
            .with_context(|| format!("Unable to write frame {frame:?}"))
    })?;

    Ok(true)
}

/// Alpha masks carried from frame to frame. Entry `i` is the mask frame `i + 1` should be
/// written with, or `None` when no pixel changed from the running mask.
#[derive(Debug, PartialEq, Eq)]
struct AlphaDeltas {
    masks: Vec<Option<Vec<u8>>>,
    changed_pixels: usize,
}

fn fold_deltas(base: &[u8], alphas: &[Vec<u8>]) -> AlphaDeltas {
    let mut running = base.to_vec();
    let mut changed_pixels = 0;

    let masks = alphas
        .iter()
        .map(|alpha| {
            let mut changed = false;

            for (current, &next) in running.iter_mut().zip(alpha) {
                if *current != next {
                    *current = next;
                    changed = true;
                    changed_pixels += 1;
                }
            }

            changed.then(|| running.clone())
        })
        .collect();

    AlphaDeltas {
        masks,
        changed_pixels,
    }
}

#[allow(clippy::as_conversions)]
#[allow(clippy::cast_precision_loss)]
fn apply_deltas(frames: &[PathBuf], cancel: &CancelFlag) -> anyhow::Result<bool> {
    let Some((first, rest)) = frames.split_first() else {
        return Ok(false);
    };

    let base = load(first)?;
    let reference = base.dimensions();

    info!("Optimizing per-frame transparency of {} frames", rest.len());

    let alphas = rest
        .par_iter()
        .map(|frame| -> anyhow::Result<Vec<u8>> {
            cancel.check()?;

            let image = load(frame)?;
            check_dimensions(frame, &image, reference)?;

            Ok(image.pixels().map(|pixel| pixel.0[3]).collect())
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let base_alpha: Vec<u8> = base.pixels().map(|pixel| pixel.0[3]).collect();
    let deltas = fold_deltas(&base_alpha, &alphas);

    let compared = (rest.len() * base_alpha.len()).max(1);
    debug!(
        "Alpha changed in {:.1}% of pixels per frame",
        deltas.changed_pixels as f64 * 100.0 / compared as f64
    );

    let rewritten = rest
        .par_iter()
        .zip(&deltas.masks)
        .map(|(frame, mask)| -> anyhow::Result<bool> {
            let Some(mask) = mask else {
                return Ok(false);
            };

            cancel.check()?;

            let mut image = load(frame)?;

            for (pixel, &alpha) in image.pixels_mut().zip(mask) {
                pixel.0[3] = alpha;
            }

            image
                .save(frame)
                .with_context(|| format!("Unable to write frame {frame:?}"))?;

            Ok(true)
        })
        .try_reduce(|| false, |left, right| Ok(left || right))?;

    Ok(rewritten)
}
