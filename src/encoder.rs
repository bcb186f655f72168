use std::ffi::OsString;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tracing::{debug, info, warn};

use crate::cancel::{CancelFlag, Cancelled};
use crate::config::{EncodeSettings, Tools};
use crate::frames::{self, scaled_dimensions};
use crate::process;
use crate::tiers::{AttemptKey, OptimizationParams};
use crate::util::HumanSize;

/// A finished encode on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
}

/// Outcome of one attempt. A failed attempt has no candidate but still reports the skip
/// directory it may have created so that it can be cleaned up.
#[derive(Clone, Debug)]
pub struct CandidateResult {
    pub key: AttemptKey,
    pub params: OptimizationParams,
    pub candidate: Option<Candidate>,
    pub skip_directory: Option<PathBuf>,
}

impl CandidateResult {
    #[must_use]
    pub const fn failed(
        key: AttemptKey,
        params: OptimizationParams,
        skip_directory: Option<PathBuf>,
    ) -> Self {
        Self {
            key,
            params,
            candidate: None,
            skip_directory,
        }
    }

    /// The candidate, if the attempt succeeded and its file is still on disk.
    #[must_use]
    pub fn valid_candidate(&self) -> Option<&Candidate> {
        self.candidate
            .as_ref()
            .filter(|candidate| candidate.path.is_file())
    }
}

/// Turns a directory of frames into one GIF at `params.output_path`.
pub trait Encode: Send + Sync + 'static {
    fn encode(
        &self,
        frames: &Path,
        params: &OptimizationParams,
        frame_rate: f64,
        cancel: &CancelFlag,
    ) -> impl Future<Output = anyhow::Result<Candidate>> + Send;
}

/// Playback rate after keeping only every `frame_skip`-th frame, so the animation runs at the
/// same speed.
#[allow(clippy::as_conversions)]
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn effective_frame_rate(frame_rate: f64, frame_skip: usize) -> f64 {
    if frame_skip > 1 {
        frame_rate / frame_skip as f64
    } else {
        frame_rate
    }
}

/// gifsicle loop flag for a play count, where 0 plays forever.
#[must_use]
pub fn loop_argument(loop_count: u32) -> Option<String> {
    match loop_count {
        0 => None,
        1 => Some("--no-loop".to_owned()),
        count => Some(format!("--loop={}", count - 1)),
    }
}

fn intermediate_path(output: &Path) -> PathBuf {
    output.with_extension("assembled.gif")
}

/// Assembles frames with gifski and then compresses the result with gifsicle.
#[derive(Clone, Debug)]
pub struct GifEncoder {
    tools: Tools,
    settings: EncodeSettings,
    poll_interval: Duration,
}

impl GifEncoder {
    #[must_use]
    pub const fn new(tools: Tools, settings: EncodeSettings, poll_interval: Duration) -> Self {
        Self {
            tools,
            settings,
            poll_interval,
        }
    }

    fn assembler_arguments(
        frames: &[PathBuf],
        output: &Path,
        quality: u32,
        frame_rate: f64,
        (width, height): (u32, u32),
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--output".into(),
            output.into(),
            "--quality".into(),
            quality.to_string().into(),
            "--fps".into(),
            frame_rate.to_string().into(),
            "--width".into(),
            width.to_string().into(),
            "--height".into(),
            height.to_string().into(),
            "--no-sort".into(),
        ];

        args.extend(frames.iter().map(OsString::from));

        args
    }

    fn optimizer_arguments(&self, input: &Path, output: &Path, lossy: u32) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![];

        if lossy > 0 {
            args.push(format!("--lossy={lossy}").into());
        }

        args.extend(
            [
                "-O3",
                "--careful",
                "--no-warnings",
                "--no-ignore-errors",
                "--resize-method=sample",
            ]
            .map(OsString::from),
        );

        if let Some(argument) = loop_argument(self.settings.loop_count) {
            args.push(argument.into());
        }

        if self.settings.preserve_animated_alpha {
            args.push("--disposal=background".into());
            args.push("--no-conserve-memory".into());
        }

        args.extend(["-i".into(), input.into(), "-o".into(), output.into()]);

        args
    }

    async fn assemble_and_optimize(
        &self,
        frames: &Path,
        params: &OptimizationParams,
        frame_rate: f64,
        intermediate: &Path,
        cancel: &CancelFlag,
    ) -> anyhow::Result<Candidate> {
        let directory = frames.to_path_buf();

        let (frame_list, dimensions) = tokio::task::spawn_blocking(move || {
            let frame_list = frames::list(&directory)?;
            let first = frame_list
                .first()
                .ok_or_else(|| anyhow!("No frames found in {directory:?}"))?;
            let dimensions = frames::dimensions(first)?;

            anyhow::Ok((frame_list, dimensions))
        })
        .await
        .context("Unable to join frame listing task")??;

        let (width, height) = scaled_dimensions(dimensions.0, dimensions.1, self.settings.scale);

        let output = process::run(
            &self.tools.gifski,
            &Self::assembler_arguments(
                &frame_list,
                intermediate,
                params.quality,
                effective_frame_rate(frame_rate, params.frame_skip),
                (width, height),
            ),
            cancel,
            self.poll_interval,
        )
        .await
        .context("Unable to run gifski")?;

        output.ensure_output("gifski", intermediate)?;

        cancel.check()?;

        let output = process::run(
            &self.tools.gifsicle,
            &self.optimizer_arguments(intermediate, &params.output_path, params.lossy),
            cancel,
            self.poll_interval,
        )
        .await
        .context("Unable to run gifsicle")?;

        output.ensure_output("gifsicle", &params.output_path)?;

        let size = tokio::fs::metadata(&params.output_path)
            .await
            .with_context(|| format!("Unable to read size of {:?}", params.output_path))?
            .len();

        Ok(Candidate {
            path: params.output_path.clone(),
            size,
        })
    }
}

impl Encode for GifEncoder {
    async fn encode(
        &self,
        frames: &Path,
        params: &OptimizationParams,
        frame_rate: f64,
        cancel: &CancelFlag,
    ) -> anyhow::Result<Candidate> {
        let intermediate = intermediate_path(&params.output_path);

        let result = self
            .assemble_and_optimize(frames, params, frame_rate, &intermediate, cancel)
            .await;

        match tokio::fs::remove_file(&intermediate).await {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Unable to remove intermediate file {intermediate:?}: {error}"),
        }

        result
    }
}

/// Runs one attempt from frame preparation to finished candidate. Never fails: every error
/// becomes a failed result so that one bad combination cannot stop its tier.
pub async fn run_attempt<E: Encode>(
    encoder: Arc<E>,
    key: AttemptKey,
    source: PathBuf,
    params: OptimizationParams,
    frame_rate: f64,
    cancel: CancelFlag,
) -> CandidateResult {
    let skip_directory = crate::skip::target_directory(&source, params.frame_skip, key);
    let mut result = CandidateResult::failed(key, params, skip_directory);

    if cancel.is_cancelled() {
        debug!(attempt = %key, "Skipping attempt after cancellation");
        return result;
    }

    debug!(
        attempt = %key,
        quality = result.params.quality,
        lossy = result.params.lossy,
        frame_skip = result.params.frame_skip,
        "Starting attempt"
    );

    let frame_skip = result.params.frame_skip;
    let prepared =
        tokio::task::spawn_blocking(move || crate::skip::prepare(&source, frame_skip, key))
            .await
            .context("Unable to join frame skip task")
            .and_then(|prepared| prepared);

    let frames = match prepared {
        Ok(frames) => frames,
        Err(error) => {
            warn!(attempt = %key, "Unable to prepare frames: {error:#}");
            return result;
        }
    };

    match encoder
        .encode(&frames, &result.params, frame_rate, &cancel)
        .await
    {
        Ok(candidate) => {
            info!(attempt = %key, size = %HumanSize(candidate.size), "Attempt finished");
            result.candidate = Some(candidate);
        }
        Err(error) if error.is::<Cancelled>() => {
            debug!(attempt = %key, "Attempt stopped by cancellation");
        }
        Err(error) => {
            warn!(attempt = %key, "Attempt failed: {error:#}");
        }
    }

    result
}
