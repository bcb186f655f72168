use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Collects temporary files and directories and removes them in one final pass.
///
/// Paths are deduplicated. Removal tolerates individual failures so one locked file never blocks
/// the rest, and anything still scheduled when the manager is dropped is removed then, which
/// covers early returns and panics.
#[derive(Debug, Default)]
pub struct CleanupManager {
    paths: BTreeSet<PathBuf>,
}

impl CleanupManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the path was already scheduled.
    pub fn schedule(&mut self, path: impl Into<PathBuf>) -> bool {
        self.paths.insert(path.into())
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Removes every scheduled path and returns how many could not be removed.
    pub fn finish(&mut self) -> usize {
        let mut failures = 0;

        // Reverse lexicographic order visits children before their parents.
        for path in std::mem::take(&mut self.paths).iter().rev() {
            if let Err(error) = remove_path(path) {
                warn!("Unable to remove temporary path {path:?}: {error}");
                failures += 1;
            }
        }

        failures
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        if !self.paths.is_empty() {
            self.finish();
        }
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };

    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    match result {
        Ok(()) => {
            debug!("Removed temporary path {path:?}");
            Ok(())
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}
