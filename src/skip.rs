use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use tracing::{debug, warn};

use crate::frames::{self, frame_file_name};
use crate::tiers::AttemptKey;

/// The directory `prepare` uses for `key`, or `None` when no copy is needed.
#[must_use]
pub fn target_directory(source: &Path, frame_skip: usize, key: AttemptKey) -> Option<PathBuf> {
    if frame_skip <= 1 {
        return None;
    }

    source
        .parent()
        .map(|parent| parent.join(key.skip_directory_name(frame_skip)))
}

/// Returns the frame directory an attempt should encode from.
///
/// A `frame_skip` of 1 (or 0) reuses `source` as is. Larger values copy every `frame_skip`-th
/// frame, starting with the first, into a directory owned by `key` next to `source`, renumbered
/// without gaps. If nothing could be copied the source is used instead.
pub fn prepare(source: &Path, frame_skip: usize, key: AttemptKey) -> anyhow::Result<PathBuf> {
    if frame_skip <= 1 {
        return Ok(source.to_path_buf());
    }

    let directory = target_directory(source, frame_skip, key)
        .ok_or_else(|| anyhow!("Frame directory {source:?} has no parent directory"))?;

    if directory.exists() {
        std::fs::remove_dir_all(&directory)
            .with_context(|| format!("Unable to remove stale skip directory {directory:?}"))?;
    }

    std::fs::create_dir_all(&directory)
        .with_context(|| format!("Unable to create skip directory {directory:?}"))?;

    let mut copied = 0_usize;

    for frame in frames::list(source)?.iter().step_by(frame_skip) {
        let target = directory.join(frame_file_name(copied));

        match std::fs::copy(frame, &target) {
            Ok(_bytes) => copied += 1,
            Err(error) => warn!("Unable to copy {frame:?} to {target:?}: {error}"),
        }
    }

    if copied == 0 {
        warn!("No frames were kept for {key} with frame skip {frame_skip}, using every frame");

        if let Err(error) = std::fs::remove_dir_all(&directory) {
            warn!("Unable to remove empty skip directory {directory:?}: {error}");
        }

        return Ok(source.to_path_buf());
    }

    debug!("Kept {copied} frames in {directory:?} for {key}");

    Ok(directory)
}
