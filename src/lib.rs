use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::{debug, info, warn};

pub mod alpha;
pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod encoder;
pub mod frames;
pub mod polish;
pub mod process;
pub mod search;
pub mod skip;
pub mod tiers;
pub mod tracker;
pub mod util;

pub use search::SearchOutcome;

use cancel::{CancelFlag, Cancelled};
use cleanup::CleanupManager;
use encoder::GifEncoder;
use polish::Polisher;
use search::Searcher;

/// Runs one conversion on a single-threaded runtime. External processes and blocking file work
/// still run in parallel; only the coordination is single-threaded.
pub fn run(config: &config::Config, cancel: &CancelFlag) -> anyhow::Result<SearchOutcome> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Unable to build async runtime")?;

    runtime.block_on(convert(config, cancel))
}

pub async fn convert(config: &config::Config, cancel: &CancelFlag) -> anyhow::Result<SearchOutcome> {
    cancel.reset();

    config
        .tools
        .verify(&config.source, config.settings.polish)
        .context("Unable to find required tools")?;

    if !config.source.is_file() {
        return Err(anyhow!("Source {:?} does not exist", config.source));
    }

    let tiers = match &config.tiers {
        Some(path) => tiers::load(path).context("Unable to load search tiers")?,
        None => tiers::default_tiers(),
    };

    let work_directory = create_work_directory(config).await?;
    debug!("Using work directory {:?}", work_directory.path());

    let mut cleanup = CleanupManager::new();
    cleanup.schedule(work_directory.path());

    let outcome = convert_in(config, cancel, tiers, work_directory.path(), &mut cleanup).await;

    let failures = tokio::task::spawn_blocking(move || cleanup.finish())
        .await
        .context("Unable to join cleanup task")?;

    if failures > 0 {
        warn!("{failures} temporary paths could not be removed");
    }

    outcome
}

/// Creates a fresh, uniquely named directory for this run's temporary files.
async fn create_work_directory(config: &config::Config) -> anyhow::Result<tempfile::TempDir> {
    let root = config.work_root();
    let prefix = config.work_directory_prefix();

    tokio::task::spawn_blocking(move || {
        util::verify_directory(&root)
            .with_context(|| format!("Unable to verify work root {root:?}"))?;

        tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&root)
            .with_context(|| format!("Unable to create work directory in {root:?}"))
    })
    .await
    .context("Unable to join work directory task")?
}

async fn prepare_frames(
    config: &config::Config,
    cancel: &CancelFlag,
    directory: &Path,
) -> anyhow::Result<Option<frames::FrameSet>> {
    let extracted = frames::extract(
        &config.tools,
        &config.source,
        directory,
        cancel,
        config.poll_interval(),
    )
    .await;

    // Tools interrupted by the same Ctrl-C exit with their own failure codes.
    let frame_set = match extracted {
        Ok(frame_set) => frame_set,
        Err(error) if cancel.is_cancelled() || error.is::<Cancelled>() => {
            debug!("Frame extraction stopped after cancellation: {error:#}");
            return Ok(None);
        }
        Err(error) => return Err(error.context("Unable to extract frames")),
    };

    if cancel.is_cancelled() {
        return Ok(None);
    }

    let frames_directory = frame_set.directory.clone();
    let preserve_animated = config.settings.preserve_animated_alpha;
    let alpha_cancel = cancel.clone();

    let processed = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
        let frame_list = frames::list(&frames_directory)?;

        if !alpha::has_transparency(&frame_list)? {
            return Ok(false);
        }

        debug!("Source frames are transparent");

        alpha::apply(&frame_list, preserve_animated, &alpha_cancel)
    })
    .await
    .context("Unable to join transparency task")?;

    match processed {
        Ok(_rewritten) => Ok((!cancel.is_cancelled()).then_some(frame_set)),
        Err(error) if cancel.is_cancelled() || error.is::<Cancelled>() => Ok(None),
        Err(error) => Err(error.context("Unable to process transparency")),
    }
}

async fn convert_in(
    config: &config::Config,
    cancel: &CancelFlag,
    tiers: Vec<tiers::BatchTier>,
    work_directory: &Path,
    cleanup: &mut CleanupManager,
) -> anyhow::Result<SearchOutcome> {
    let Some(frame_set) = prepare_frames(config, cancel, &work_directory.join("frames")).await?
    else {
        return Ok(SearchOutcome::Cancelled);
    };

    let encoder = Arc::new(GifEncoder::new(
        config.tools.clone(),
        config.settings.clone(),
        config.poll_interval(),
    ));

    let polisher = config
        .settings
        .polish
        .then(|| Polisher::new(config.tools.magick.clone(), config.poll_interval()));

    let searcher = Searcher::new(
        encoder,
        config.settings.clone(),
        tiers,
        work_directory.to_path_buf(),
        cancel.clone(),
    )
    .with_polisher(polisher);

    let output = config.output_path();

    info!("Converting {:?} to {output:?}", config.source);

    match config.target_size_bytes() {
        Some(target) => searcher.search(&frame_set, target, &output, cleanup).await,
        None => {
            searcher
                .encode_maximum_quality(&frame_set, &output, cleanup)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::path::PathBuf;

    use clap::Parser;

    use super::*;

    fn entries(directory: &Path) -> Vec<PathBuf> {
        let mut entries: Vec<_> = std::fs::read_dir(directory)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        entries.sort();
        entries
    }

    #[cfg(unix)]
    fn script(directory: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = directory.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// A video conversion whose tools are shell scripts, with the work tree under `work_root`.
    #[cfg(unix)]
    fn video_config(bin: &Path, source: &Path, work_root: &Path, ffmpeg_body: &str) -> config::Config {
        let ffmpeg = script(bin, "ffmpeg", ffmpeg_body);
        let succeed = script(bin, "succeed", "exit 0");
        let fail = script(bin, "fail", "exit 1");

        config::Config::parse_from([
            OsStr::new("gif-target-size"),
            OsStr::new("--target-size"),
            OsStr::new("100"),
            OsStr::new("--poll-interval-ms"),
            OsStr::new("1000"),
            OsStr::new("--work-directory"),
            work_root.as_os_str(),
            OsStr::new("--ffmpeg"),
            ffmpeg.as_os_str(),
            OsStr::new("--ffprobe"),
            fail.as_os_str(),
            OsStr::new("--gifski"),
            succeed.as_os_str(),
            OsStr::new("--gifsicle"),
            succeed.as_os_str(),
            source.as_os_str(),
        ])
    }

    #[test]
    fn missing_tools_stop_before_any_work() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("clip.gif");
        std::fs::write(&source, b"GIF89a").unwrap();

        let gifski = root.path().join("no-such-gifski");
        let config = config::Config::parse_from([
            OsStr::new("gif-target-size"),
            OsStr::new("--gifski"),
            gifski.as_os_str(),
            source.as_os_str(),
        ]);

        let error = run(&config, &CancelFlag::new()).unwrap_err();

        assert!(format!("{error:#}").contains("gifski"));
        assert_eq!(entries(root.path()), vec![source]);
    }

    #[cfg(unix)]
    #[test]
    fn work_directory_keeps_existing_files() {
        let bin = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("clip.mp4");
        std::fs::write(&source, b"").unwrap();

        let work_root = root.path().join("my_stuff");
        std::fs::create_dir(&work_root).unwrap();
        let precious = work_root.join("precious.txt");
        std::fs::write(&precious, b"keep me").unwrap();

        let config = video_config(bin.path(), &source, &work_root, "exit 1");

        assert!(run(&config, &CancelFlag::new()).is_err());

        assert_eq!(entries(&work_root), vec![precious.clone()]);
        assert_eq!(std::fs::read(&precious).unwrap(), b"keep me");
    }

    #[cfg(unix)]
    #[test]
    fn interrupted_frame_extraction_is_cancelled() {
        let bin = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("clip.mp4");
        std::fs::write(&source, b"").unwrap();

        // Exits on its own before the next poll, the way ffmpeg does on SIGINT.
        let config = video_config(bin.path(), &source, root.path(), "sleep 0.3\nexit 255");

        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            trigger.cancel();
        });

        let outcome = run(&config, &cancel).unwrap();
        canceller.join().unwrap();

        assert_eq!(outcome, SearchOutcome::Cancelled);
        assert_eq!(outcome.exit_code(), 130);
        assert_eq!(entries(root.path()), vec![source]);
    }
}
