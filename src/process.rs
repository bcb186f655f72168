use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cancel::{CancelFlag, Cancelled};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of one external process: `Launched -> Running -> Exited | Terminated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Launched,
    Running,
    /// Exit code, or `None` when the process was ended by a signal.
    Exited(Option<i32>),
    Terminated,
}

impl ProcessState {
    /// State after one poll. `exit` is the exit observed during the poll, if any.
    ///
    /// An observed exit wins over a pending cancellation, since the output already exists.
    #[must_use]
    pub const fn advance(self, exit: Option<Option<i32>>, cancelled: bool) -> Self {
        match self {
            Self::Exited(_) | Self::Terminated => self,
            Self::Launched | Self::Running => match exit {
                Some(code) => Self::Exited(code),
                None if cancelled => Self::Terminated,
                None => Self::Running,
            },
        }
    }

    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Exited(_) | Self::Terminated)
    }
}

#[derive(Clone, Debug)]
pub struct ProcessOutput {
    pub state: ProcessState,
    pub stderr: String,
}

impl ProcessOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.state == ProcessState::Exited(Some(0))
    }

    /// Turns anything but a clean exit that produced `expected_output` into an error.
    pub fn ensure_output(&self, name: &str, expected_output: &Path) -> anyhow::Result<()> {
        match self.state {
            ProcessState::Terminated => {
                return Err(anyhow::Error::from(Cancelled))
                    .with_context(|| format!("{name} was terminated"));
            }
            ProcessState::Exited(code) if code != Some(0) => {
                return Err(anyhow!(
                    "{name} exited with status {} and the following output:\n{}",
                    code.map_or_else(|| "signal".to_owned(), |code| code.to_string()),
                    self.stderr.trim_end()
                ));
            }
            ProcessState::Launched | ProcessState::Running | ProcessState::Exited(_) => {}
        }

        if !self.success() {
            return Err(anyhow!("{name} did not finish"));
        }

        if !expected_output.exists() {
            return Err(anyhow!(
                "{name} did not produce {expected_output:?}:\n{}",
                self.stderr.trim_end()
            ));
        }

        Ok(())
    }
}

/// Runs `program` to completion, polling every `poll_interval` so that a cancellation request
/// terminates the process promptly. The process is always waited on before returning.
pub async fn run(
    program: &Path,
    args: &[OsString],
    cancel: &CancelFlag,
    poll_interval: Duration,
) -> anyhow::Result<ProcessOutput> {
    let name = program.to_string_lossy().to_string();

    cancel
        .check()
        .with_context(|| format!("Cancelled before starting {name}"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Unable to spawn {name} subprocess"))?;

    let mut state = ProcessState::Launched;
    debug!(program = %name, pid = child.id(), "Launched subprocess");

    // Drained concurrently so a chatty process never blocks on a full pipe.
    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buffer = Vec::with_capacity(256);
            let _bytes = stderr.read_to_end(&mut buffer).await;
            buffer
        })
    });

    while !state.is_finished() {
        let exit = match tokio::time::timeout(poll_interval, child.wait()).await {
            Ok(status) => Some(
                status
                    .with_context(|| format!("Unable to wait for {name} subprocess"))?
                    .code(),
            ),
            Err(_elapsed) => None,
        };

        state = state.advance(exit, cancel.is_cancelled());

        if state == ProcessState::Terminated {
            debug!(program = %name, "Terminating subprocess after cancellation");

            if let Err(error) = child.start_kill() {
                warn!("Unable to signal {name} subprocess: {error}");
            }

            child
                .wait()
                .await
                .with_context(|| format!("Unable to wait for terminated {name} subprocess"))?;
        }
    }

    let stderr = match stderr_task {
        Some(task) => String::from_utf8_lossy(&task.await.unwrap_or_default()).into_owned(),
        None => String::new(),
    };

    Ok(ProcessOutput { state, stderr })
}
