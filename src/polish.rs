use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use indicatif::ProgressBar;
use tracing::{info, warn};

use crate::cancel::{CancelFlag, Cancelled};
use crate::encoder::Candidate;
use crate::process;
use crate::util::{create_progress_style, verify_filename, HumanSize};

/// Final ImageMagick pass over the chosen GIF.
#[derive(Clone, Debug)]
pub struct Polisher {
    program: PathBuf,
    poll_interval: Duration,
}

impl Polisher {
    #[must_use]
    pub const fn new(program: PathBuf, poll_interval: Duration) -> Self {
        Self {
            program,
            poll_interval,
        }
    }

    fn arguments(input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![input.into()];

        args.extend(
            [
                "-coalesce",
                "-layers",
                "optimize",
                "-fuzz",
                "0%",
                "-layers",
                "optimize-transparency",
                "-quiet",
            ]
            .map(OsString::from),
        );

        args.push(output.into());

        args
    }

    /// Writes a polished copy of `input` next to it.
    pub async fn polish(&self, input: &Path, cancel: &CancelFlag) -> anyhow::Result<Candidate> {
        let output = input.with_extension("polished.gif");

        let result = process::run(
            &self.program,
            &Self::arguments(input, &output),
            cancel,
            self.poll_interval,
        )
        .await
        .context("Unable to run ImageMagick")?;

        result.ensure_output("ImageMagick", &output)?;

        let size = tokio::fs::metadata(&output)
            .await
            .with_context(|| format!("Unable to read size of {output:?}"))?
            .len();

        Ok(Candidate { path: output, size })
    }
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!("Unable to remove temporary file {path:?}: {error}"),
    }
}

/// Copies the winning candidate to `output`, through `polisher` when one is given.
///
/// A polish that fails or grows the file is discarded in favor of the unpolished winner.
/// Cancellation during the polish is returned as an error.
pub async fn finalize(
    winner: &Candidate,
    output: &Path,
    polisher: Option<&Polisher>,
    cancel: &CancelFlag,
) -> anyhow::Result<Candidate> {
    verify_filename(output)
        .with_context(|| format!("Unable to verify output filename {output:?}"))?;

    let progress_bar = ProgressBar::new_spinner();
    progress_bar.enable_steady_tick(Duration::from_millis(120));
    progress_bar.set_style(
        create_progress_style("{spinner:.green} [{elapsed_precise}] {msg}")
            .context("Unable to create finalization progress bar style")?,
    );

    let mut source = winner.path.clone();

    if let Some(polisher) = polisher {
        progress_bar.set_message("Polishing...");

        let polished = polisher.polish(&winner.path, cancel).await;

        // ImageMagick interrupted by the same Ctrl-C exits with an ordinary failure.
        if cancel.is_cancelled() {
            progress_bar.set_message("Polishing...cancelled!");
            progress_bar.finish();
            remove_if_present(&winner.path.with_extension("polished.gif")).await;

            return match polished {
                Err(error) if error.is::<Cancelled>() => Err(error),
                _ => Err(anyhow::Error::from(Cancelled)).context("Cancelled while polishing"),
            };
        }

        match polished {
            Ok(polished) if polished.size <= winner.size => {
                info!(
                    "Polish reduced {} to {}",
                    HumanSize(winner.size),
                    HumanSize(polished.size)
                );
                source = polished.path;
            }
            Ok(polished) => {
                info!(
                    "Polish grew the file to {}, keeping the unpolished result",
                    HumanSize(polished.size)
                );
                remove_if_present(&polished.path).await;
            }
            Err(error) => {
                warn!("Unable to polish {:?}, keeping the unpolished result: {error:#}", winner.path);
                remove_if_present(&winner.path.with_extension("polished.gif")).await;
            }
        }
    }

    cancel.check().context("Cancelled before writing output")?;

    progress_bar.set_message("Writing output...");

    tokio::fs::copy(&source, output)
        .await
        .with_context(|| format!("Unable to copy {source:?} to {output:?}"))?;

    if source != winner.path {
        remove_if_present(&source).await;
    }

    let size = tokio::fs::metadata(output)
        .await
        .with_context(|| format!("Unable to read size of {output:?}"))?
        .len();

    progress_bar.set_message("Writing output...done!");
    progress_bar.finish();

    Ok(Candidate {
        path: output.to_path_buf(),
        size,
    })
}
