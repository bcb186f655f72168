use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser};
use tracing::debug;

/// Settings that shape every encode attempt. Supplied once per run and never mutated.
#[derive(Clone, Args, Debug, PartialEq, Eq)]
pub struct EncodeSettings {
    /// Always encode at quality 100, whatever the search tier suggests
    #[arg(long)]
    pub lock_quality: bool,

    /// Never apply lossy compression
    #[arg(long)]
    pub lock_lossy: bool,

    /// Never drop frames
    #[arg(long)]
    pub lock_frame_skip: bool,

    /// Output dimensions as a percentage of the source frame size
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..), default_value_t = 100)]
    pub scale: u32,

    /// Number of times the animation plays (0 loops forever)
    #[arg(long, default_value_t = 0)]
    pub loop_count: u32,

    /// Keep per-frame transparency instead of reusing the first frame's alpha mask
    #[arg(long)]
    pub preserve_animated_alpha: bool,

    /// Run a final ImageMagick optimization pass over the chosen GIF
    #[arg(long)]
    pub polish: bool,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            lock_quality: false,
            lock_lossy: false,
            lock_frame_skip: false,
            scale: 100,
            loop_count: 0,
            preserve_animated_alpha: false,
            polish: false,
        }
    }
}

/// Locations of the external programs the conversion drives.
#[derive(Clone, Args, Debug, PartialEq, Eq)]
pub struct Tools {
    /// gifski executable used to assemble frames into a GIF
    #[arg(long, default_value = "gifski")]
    pub gifski: PathBuf,

    /// gifsicle executable used for lossy optimization
    #[arg(long, default_value = "gifsicle")]
    pub gifsicle: PathBuf,

    /// ImageMagick executable used by the polish pass
    #[arg(long, default_value = "magick")]
    pub magick: PathBuf,

    /// ffmpeg executable used to extract video frames
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// ffprobe executable used to detect the video frame rate
    #[arg(long, default_value = "ffprobe")]
    pub ffprobe: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            gifski: "gifski".into(),
            gifsicle: "gifsicle".into(),
            magick: "magick".into(),
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
        }
    }
}

impl Tools {
    /// Resolves every program this run needs, failing on the first one that cannot be found.
    pub fn verify(&self, source: &Path, polish: bool) -> anyhow::Result<()> {
        let mut required = vec![("gifski", &self.gifski), ("gifsicle", &self.gifsicle)];

        if !crate::frames::is_gif(source) {
            required.push(("ffmpeg", &self.ffmpeg));
            required.push(("ffprobe", &self.ffprobe));
        }

        if polish {
            required.push(("magick", &self.magick));
        }

        for (name, program) in required {
            let resolved = which::which(program)
                .with_context(|| format!("Unable to locate {name} at {program:?}"))?;

            debug!("Using {name} at {resolved:?}");
        }

        Ok(())
    }
}

#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Target output size in KiB; omit for a single maximum-quality encode
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    pub target_size: Option<u64>,

    /// Output GIF path (defaults to <source>_optimized.gif next to the source)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory to create the run's temporary directory in (defaults to the source's directory)
    #[arg(long)]
    pub work_directory: Option<PathBuf>,

    /// JSON file describing the search tiers
    #[arg(long)]
    pub tiers: Option<PathBuf>,

    /// How often running subprocesses are checked for cancellation, in milliseconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..), default_value_t = 100)]
    pub poll_interval_ms: u64,

    #[command(flatten)]
    pub settings: EncodeSettings,

    #[command(flatten)]
    pub tools: Tools,

    /// Source video or animated image
    pub source: PathBuf,
}

impl Config {
    fn source_stem(&self) -> String {
        self.source
            .file_stem()
            .map_or_else(|| "output".to_owned(), |stem| stem.to_string_lossy().to_string())
    }

    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            self.source
                .with_file_name(format!("{}_optimized.gif", self.source_stem()))
        })
    }

    /// Directory the run creates its own temporary directory in. Nothing already in it is
    /// touched.
    #[must_use]
    pub fn work_root(&self) -> PathBuf {
        self.work_directory.clone().unwrap_or_else(|| {
            self.source
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        })
    }

    /// Name prefix of the run's temporary directory; a random suffix keeps runs apart.
    #[must_use]
    pub fn work_directory_prefix(&self) -> String {
        format!("{}_conversion_temp_", self.source_stem())
    }

    #[must_use]
    pub fn target_size_bytes(&self) -> Option<u64> {
        self.target_size.map(|kib| kib.saturating_mul(1024))
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
