use std::ffi::OsString;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context};
use cached::{proc_macro::cached, UnboundCache};
use image::codecs::gif::GifDecoder;
use image::AnimationDecoder;
use indicatif::ProgressBar;
use serde::Deserialize;
use tracing::{info, warn};

use crate::cancel::CancelFlag;
use crate::config::Tools;
use crate::process;
use crate::util::{create_progress_style, verify_directory};

pub const DEFAULT_FRAME_RATE: f64 = 24.0;
pub const DEFAULT_GIF_FRAME_RATE: f64 = 15.0;

const FRAME_PREFIX: &str = "frame_";
const FRAME_EXTENSION: &str = "png";

/// An ordered, densely numbered sequence of frame images and the rate they play at.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameSet {
    pub directory: PathBuf,
    pub frame_rate: f64,
    pub frame_count: usize,
}

#[must_use]
pub fn frame_file_name(index: usize) -> String {
    format!("{FRAME_PREFIX}{index:06}.{FRAME_EXTENSION}")
}

#[must_use]
pub fn is_gif(path: &Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("gif"))
}

/// Sorted frame files in `directory`.
pub fn list(directory: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut frames = vec![];

    for entry in std::fs::read_dir(directory)
        .with_context(|| format!("Unable to read frame directory {directory:?}"))?
    {
        let path = entry
            .with_context(|| format!("Unable to read entry in {directory:?}"))?
            .path();

        let is_frame = path
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case(FRAME_EXTENSION));

        if is_frame && path.is_file() {
            frames.push(path);
        }
    }

    frames.sort();

    Ok(frames)
}

pub fn dimensions(frame: &Path) -> anyhow::Result<(u32, u32)> {
    image::image_dimensions(frame)
        .with_context(|| format!("Unable to read dimensions of frame {frame:?}"))
}

/// Applies a percentage scale, never going below one pixel.
#[allow(clippy::as_conversions)]
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn scaled_dimensions(width: u32, height: u32, scale: u32) -> (u32, u32) {
    let scale_axis =
        |value: u32| ((u64::from(value) * u64::from(scale)) / 100).clamp(1, u64::from(u32::MAX)) as u32;

    (scale_axis(width), scale_axis(height))
}

/// Decodes `source` into `directory` as numbered RGBA PNGs.
///
/// GIF decoding runs on a blocking thread and stops between frames once `cancel` is set. Video
/// sources go through ffmpeg, which is terminated on cancellation like any other subprocess.
pub async fn extract(
    tools: &Tools,
    source: &Path,
    directory: &Path,
    cancel: &CancelFlag,
    poll_interval: Duration,
) -> anyhow::Result<FrameSet> {
    verify_directory(directory)
        .with_context(|| format!("Unable to verify frame directory {directory:?}"))?;

    let frame_rate = if is_gif(source) {
        let gif_source = source.to_path_buf();
        let gif_directory = directory.to_path_buf();
        let gif_cancel = cancel.clone();

        tokio::task::spawn_blocking(move || extract_gif(&gif_source, &gif_directory, &gif_cancel))
            .await
            .context("Unable to join GIF decoding task")?
            .context("Unable to extract GIF frames")?
    } else {
        let ffprobe = tools.ffprobe.clone();
        let probe_source = source.to_path_buf();

        let probed = tokio::task::spawn_blocking(move || probe_frame_rate(&ffprobe, &probe_source))
            .await
            .context("Unable to join frame rate probe task")?;

        let frame_rate = probed.unwrap_or_else(|error| {
            warn!("Unable to detect frame rate of {source:?}, using {DEFAULT_FRAME_RATE}: {error:#}");
            DEFAULT_FRAME_RATE
        });

        extract_video(&tools.ffmpeg, source, directory, frame_rate, cancel, poll_interval)
            .await
            .context("Unable to extract video frames")?;

        frame_rate
    };

    let frame_count = list(directory)?.len();

    if frame_count == 0 {
        return Err(anyhow!("No frames were extracted from {source:?}"));
    }

    info!("Extracted {frame_count} frames at {frame_rate} FPS");

    Ok(FrameSet {
        directory: directory.to_path_buf(),
        frame_rate,
        frame_count,
    })
}

#[allow(clippy::as_conversions)]
#[allow(clippy::cast_precision_loss)]
fn extract_gif(source: &Path, directory: &Path, cancel: &CancelFlag) -> anyhow::Result<f64> {
    let file = File::open(source).with_context(|| format!("Unable to open {source:?}"))?;
    let decoder = GifDecoder::new(BufReader::new(file))
        .with_context(|| format!("Unable to decode {source:?} as a GIF"))?;

    let progress_bar = ProgressBar::new_spinner();
    progress_bar.set_style(
        create_progress_style("{spinner:.green} [{elapsed_precise}] Extracting frames... {human_pos}")
            .context("Unable to create frame extraction progress bar style")?,
    );

    let mut total_delay_ms = 0.0_f64;
    let mut frame_count = 0_usize;

    for (index, frame) in decoder.into_frames().enumerate() {
        cancel.check()?;

        let frame = frame.with_context(|| format!("Unable to decode frame {index} of {source:?}"))?;
        let (numerator, denominator) = frame.delay().numer_denom_ms();

        if denominator > 0 {
            total_delay_ms += f64::from(numerator) / f64::from(denominator);
        }

        let path = directory.join(frame_file_name(index));
        frame
            .into_buffer()
            .save(&path)
            .with_context(|| format!("Unable to write frame {path:?}"))?;

        frame_count += 1;
        progress_bar.inc(1);
    }

    progress_bar.finish();

    Ok(gif_frame_rate(total_delay_ms, frame_count))
}

#[allow(clippy::as_conversions)]
#[allow(clippy::cast_precision_loss)]
fn gif_frame_rate(total_delay_ms: f64, frame_count: usize) -> f64 {
    if frame_count == 0 {
        return DEFAULT_GIF_FRAME_RATE;
    }

    let average_delay_ms = total_delay_ms / frame_count as f64;

    if average_delay_ms > 0.0 {
        (1000.0 / average_delay_ms).round().max(1.0)
    } else {
        DEFAULT_GIF_FRAME_RATE
    }
}

async fn extract_video(
    ffmpeg: &Path,
    source: &Path,
    directory: &Path,
    frame_rate: f64,
    cancel: &CancelFlag,
    poll_interval: Duration,
) -> anyhow::Result<()> {
    let progress_bar = ProgressBar::new_spinner();
    progress_bar.enable_steady_tick(Duration::from_millis(120));
    progress_bar.set_style(
        create_progress_style("{spinner:.green} [{elapsed_precise}] {msg}")
            .context("Unable to create frame extraction progress bar style")?,
    );
    progress_bar.set_message("Extracting frames...");

    let args: Vec<OsString> = vec![
        "-v".into(),
        "error".into(),
        "-i".into(),
        source.into(),
        "-vf".into(),
        format!("fps={frame_rate}").into(),
        "-pix_fmt".into(),
        "rgba".into(),
        directory
            .join(format!("{FRAME_PREFIX}%06d.{FRAME_EXTENSION}"))
            .into(),
    ];

    let result = process::run(ffmpeg, &args, cancel, poll_interval)
        .await
        .context("Unable to run FFmpeg frame extraction")?;

    if let Err(error) = result.ensure_output("FFmpeg", directory) {
        progress_bar.set_message("Extracting frames...failed!");
        progress_bar.finish();

        return Err(error);
    }

    progress_bar.set_message("Extracting frames...done!");
    progress_bar.finish();

    Ok(())
}

#[derive(Deserialize)]
struct ProbeStream {
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

#[derive(Deserialize)]
struct Probe {
    streams: Vec<ProbeStream>,
}

fn parse_rational(text: &str) -> Option<f64> {
    let value = match text.split_once('/') {
        Some((numerator, denominator)) => {
            let denominator: f64 = denominator.trim().parse().ok()?;

            if denominator == 0.0 {
                return None;
            }

            numerator.trim().parse::<f64>().ok()? / denominator
        }
        None => text.trim().parse().ok()?,
    };

    value.is_finite().then_some(value)
}

/// Picks a usable whole frame rate out of an ffprobe report.
fn frame_rate_from_probe(json: &str) -> anyhow::Result<f64> {
    let probe: Probe = serde_json::from_str(json).context("Unable to parse ffprobe output")?;

    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("ffprobe reported no video stream"))?;

    [stream.avg_frame_rate, stream.r_frame_rate]
        .into_iter()
        .flatten()
        .filter_map(|text| parse_rational(&text))
        .map(f64::round)
        .find(|rate| (1.0..=120.0).contains(rate))
        .ok_or_else(|| anyhow!("ffprobe did not report a usable frame rate"))
}

#[cached(
    result = true,
    ty = "UnboundCache<String, f64>",
    create = "{ UnboundCache::with_capacity(1) }",
    convert = r#"{ format!("{}|{}", ffprobe.to_string_lossy(), source.to_string_lossy()) }"#
)]
pub fn probe_frame_rate(ffprobe: &Path, source: &Path) -> anyhow::Result<f64> {
    let child = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=avg_frame_rate,r_frame_rate",
            "-of",
            "json",
        ])
        .arg(source)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Unable to spawn ffprobe subprocess")?;

    let result = child
        .wait_with_output()
        .context("Unable to wait for ffprobe to finish")?;

    if !result.status.success() {
        return Err(anyhow!(
            "ffprobe returned error code {} and the following output:\n{}",
            result.status,
            String::from_utf8_lossy(&result.stderr)
        ));
    }

    frame_rate_from_probe(
        std::str::from_utf8(&result.stdout).context("Unable to parse ffprobe output as UTF-8")?,
    )
}
