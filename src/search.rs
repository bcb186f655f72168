use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use indicatif::ProgressBar;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::{CancelFlag, Cancelled};
use crate::cleanup::CleanupManager;
use crate::config::EncodeSettings;
use crate::encoder::{run_attempt, Candidate, CandidateResult, Encode};
use crate::frames::FrameSet;
use crate::polish::{finalize, Polisher};
use crate::tiers::{tier_directory_name, AttemptKey, BatchTier, OptimizationParams};
use crate::tracker::{BestResultTracker, ACCEPTABLE_TOLERANCE};
use crate::util::{create_progress_style, HumanSize};

/// How a conversion ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchOutcome {
    /// The output was written; it holds the final file and its size.
    Found(Candidate),
    NotFound,
    Cancelled,
}

impl SearchOutcome {
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Found(_) => 0,
            Self::NotFound => 2,
            Self::Cancelled => 130,
        }
    }
}

/// Why a tier stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TierOutcome {
    /// Nothing conclusive; move on to the next tier.
    Exhausted,
    /// A candidate within the tolerance was found.
    Acceptable,
    /// Every valid result fit the target, so lower tiers can only do worse.
    AllWithinTarget,
    Cancelled,
}

#[derive(Debug, Default)]
struct TierTally {
    valid: usize,
    over_target: usize,
}

impl TierTally {
    const fn all_within_target(&self) -> bool {
        self.valid > 0 && self.over_target == 0
    }
}

/// Walks the tier table from the most faithful encodes to the most aggressive, running each
/// tier's attempts concurrently, until a candidate fits the target well enough.
pub struct Searcher<E: Encode> {
    encoder: Arc<E>,
    settings: EncodeSettings,
    tiers: Vec<BatchTier>,
    work_directory: PathBuf,
    polisher: Option<Polisher>,
    cancel: CancelFlag,
}

impl<E: Encode> Searcher<E> {
    #[must_use]
    pub const fn new(
        encoder: Arc<E>,
        settings: EncodeSettings,
        tiers: Vec<BatchTier>,
        work_directory: PathBuf,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            encoder,
            settings,
            tiers,
            work_directory,
            polisher: None,
            cancel,
        }
    }

    #[must_use]
    pub fn with_polisher(mut self, polisher: Option<Polisher>) -> Self {
        self.polisher = polisher;
        self
    }

    async fn create_tier_directory(
        &self,
        tier: usize,
        cleanup: &mut CleanupManager,
    ) -> anyhow::Result<PathBuf> {
        let directory = self.work_directory.join(tier_directory_name(tier));
        cleanup.schedule(&directory);

        tokio::fs::create_dir_all(&directory)
            .await
            .with_context(|| format!("Unable to create tier directory {directory:?}"))?;

        Ok(directory)
    }

    /// Searches for the candidate closest to `target` bytes without exceeding it and writes it
    /// to `output`. Every temporary path is handed to `cleanup`.
    pub async fn search(
        &self,
        frames: &FrameSet,
        target: u64,
        output: &Path,
        cleanup: &mut CleanupManager,
    ) -> anyhow::Result<SearchOutcome> {
        let mut tracker = BestResultTracker::new(target);

        info!("Searching for a GIF of at most {}", HumanSize(target));

        for (index, tier) in self.tiers.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(SearchOutcome::Cancelled);
            }

            let directory = self.create_tier_directory(index, cleanup).await?;

            let outcome = self
                .run_tier(index, tier, &directory, frames, &mut tracker, cleanup)
                .await
                .with_context(|| format!("Unable to run search tier {index}"))?;

            debug!(tier = index, ?outcome, "Tier finished");

            match outcome {
                TierOutcome::Cancelled => return Ok(SearchOutcome::Cancelled),
                TierOutcome::Acceptable | TierOutcome::AllWithinTarget => break,
                TierOutcome::Exhausted => {}
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(SearchOutcome::Cancelled);
        }

        match tracker.into_best() {
            Some(best) if best.path.is_file() => self.finish(&best, output).await,
            Some(best) => {
                warn!("Best candidate {:?} disappeared before it could be copied", best.path);
                Ok(SearchOutcome::NotFound)
            }
            None => Ok(SearchOutcome::NotFound),
        }
    }

    /// Encodes once at maximum quality without a size budget.
    pub async fn encode_maximum_quality(
        &self,
        frames: &FrameSet,
        output: &Path,
        cleanup: &mut CleanupManager,
    ) -> anyhow::Result<SearchOutcome> {
        let directory = self.create_tier_directory(0, cleanup).await?;

        let key = AttemptKey::new(0, 0);
        let params = OptimizationParams::maximum_quality(directory.join(key.candidate_file_name()));

        info!("Encoding at maximum quality");

        let result = run_attempt(
            Arc::clone(&self.encoder),
            key,
            frames.directory.clone(),
            params,
            frames.frame_rate,
            self.cancel.clone(),
        )
        .await;

        if let Some(skip_directory) = &result.skip_directory {
            cleanup.schedule(skip_directory);
        }

        if self.cancel.is_cancelled() {
            return Ok(SearchOutcome::Cancelled);
        }

        match result.valid_candidate() {
            Some(candidate) => self.finish(candidate, output).await,
            None => Ok(SearchOutcome::NotFound),
        }
    }

    async fn finish(&self, best: &Candidate, output: &Path) -> anyhow::Result<SearchOutcome> {
        match finalize(best, output, self.polisher.as_ref(), &self.cancel).await {
            Ok(written) => {
                info!("Wrote {:?} ({})", written.path, HumanSize(written.size));
                Ok(SearchOutcome::Found(written))
            }
            Err(error) if error.is::<Cancelled>() => Ok(SearchOutcome::Cancelled),
            Err(error) => Err(error.context("Unable to write the selected GIF")),
        }
    }

    async fn run_tier(
        &self,
        index: usize,
        tier: &BatchTier,
        directory: &Path,
        frames: &FrameSet,
        tracker: &mut BestResultTracker,
        cleanup: &mut CleanupManager,
    ) -> anyhow::Result<TierOutcome> {
        let attempts = tier.attempts(index, directory, &self.settings);

        info!("Starting tier {index} with {} attempts", attempts.len());

        let progress_bar = ProgressBar::new(attempts.len().try_into().unwrap_or(u64::MAX));
        progress_bar.set_style(
            create_progress_style(
                "{spinner:.green} [{elapsed_precise}] Tier {msg} [{wide_bar:.cyan/blue}] {pos:>3}/{len:3} (ETA: {smooth_eta:>3})",
            )
            .context("Unable to create search progress bar style")?,
        );
        progress_bar.set_message(index.to_string());
        progress_bar.enable_steady_tick(std::time::Duration::from_secs(1));

        // Attempts of this tier stop when the run is cancelled or when the tier ends early.
        let tier_cancel = self.cancel.child();
        let mut tasks: JoinSet<CandidateResult> = JoinSet::new();

        for (key, params) in attempts {
            if let Some(skip_directory) =
                crate::skip::target_directory(&frames.directory, params.frame_skip, key)
            {
                cleanup.schedule(skip_directory);
            }

            tasks.spawn(run_attempt(
                Arc::clone(&self.encoder),
                key,
                frames.directory.clone(),
                params,
                frames.frame_rate,
                tier_cancel.clone(),
            ));
        }

        let mut tally = TierTally::default();
        let mut outcome = None;

        while let Some(joined) = tasks.join_next().await {
            if self.cancel.is_cancelled() {
                outcome = Some(TierOutcome::Cancelled);
                break;
            }

            progress_bar.inc(1);

            let result = match joined {
                Ok(result) => result,
                Err(error) => {
                    warn!("Search attempt task did not complete: {error}");
                    continue;
                }
            };

            if let Some(skip_directory) = &result.skip_directory {
                cleanup.schedule(skip_directory);
            }

            let Some(candidate) = result.valid_candidate() else {
                continue;
            };

            tally.valid += 1;

            if candidate.size > tracker.target() {
                tally.over_target += 1;
                debug!(attempt = %result.key, size = candidate.size, "Candidate exceeds target");
                continue;
            }

            if tracker.consider(candidate) {
                info!(
                    attempt = %result.key,
                    quality = result.params.quality,
                    lossy = result.params.lossy,
                    frame_skip = result.params.frame_skip,
                    "New best candidate: {}",
                    HumanSize(candidate.size)
                );

                if tracker.is_acceptable(ACCEPTABLE_TOLERANCE) {
                    outcome = Some(TierOutcome::Acceptable);
                    break;
                }
            }
        }

        if outcome.is_some() {
            tier_cancel.cancel();

            while let Some(joined) = tasks.join_next().await {
                if let Err(error) = joined {
                    warn!("Search attempt task did not complete: {error}");
                }
            }
        }

        progress_bar.finish();

        Ok(outcome.unwrap_or(if tally.all_within_target() {
            TierOutcome::AllWithinTarget
        } else {
            TierOutcome::Exhausted
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::frames::frame_file_name;

    /// Size in bytes (or failure) and duration of a fake encode.
    type Plan = fn(&OptimizationParams) -> (Option<u64>, u64);

    struct FakeEncoder {
        plan: Plan,
        launched: Mutex<Vec<OptimizationParams>>,
    }

    impl FakeEncoder {
        fn new(plan: Plan) -> Arc<Self> {
            Arc::new(Self {
                plan,
                launched: Mutex::new(vec![]),
            })
        }

        fn launched_tiers(&self) -> BTreeSet<String> {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .map(|params| {
                    params
                        .output_path
                        .parent()
                        .unwrap()
                        .file_name()
                        .unwrap()
                        .to_string_lossy()
                        .into_owned()
                })
                .collect()
        }
    }

    impl Encode for FakeEncoder {
        async fn encode(
            &self,
            _frames: &Path,
            params: &OptimizationParams,
            _frame_rate: f64,
            cancel: &CancelFlag,
        ) -> anyhow::Result<Candidate> {
            self.launched.lock().unwrap().push(params.clone());

            let (size, delay_ms) = (self.plan)(params);
            let deadline = tokio::time::Instant::now() + Duration::from_millis(delay_ms);

            while tokio::time::Instant::now() < deadline {
                cancel.check()?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            let size = size.ok_or_else(|| anyhow::anyhow!("encoder rejected parameters"))?;

            tokio::fs::write(&params.output_path, vec![0_u8; size.try_into().unwrap()]).await?;

            Ok(Candidate {
                path: params.output_path.clone(),
                size,
            })
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
        frames: FrameSet,
        output: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let work = root.path().join("clip_conversion_temp");
            let directory = work.join("frames");
            std::fs::create_dir_all(&directory).unwrap();

            for index in 0..6 {
                std::fs::write(directory.join(frame_file_name(index)), b"png").unwrap();
            }

            let output = root.path().join("clip_optimized.gif");

            Self {
                root,
                frames: FrameSet {
                    directory,
                    frame_rate: 12.0,
                    frame_count: 6,
                },
                output,
            }
        }

        fn work(&self) -> PathBuf {
            self.root.path().join("clip_conversion_temp")
        }

        fn searcher<E: Encode>(
            &self,
            encoder: &Arc<E>,
            tiers: Vec<BatchTier>,
            cancel: &CancelFlag,
        ) -> Searcher<E> {
            Searcher::new(
                Arc::clone(encoder),
                EncodeSettings::default(),
                tiers,
                self.work(),
                cancel.clone(),
            )
        }

        /// Paths left in the work directory other than the source frames.
        fn leftovers(&self) -> Vec<PathBuf> {
            std::fs::read_dir(self.work())
                .unwrap()
                .map(|entry| entry.unwrap().path())
                .filter(|path| *path != self.frames.directory)
                .collect()
        }
    }

    fn kib(value: u64) -> u64 {
        value * 1024
    }

    #[tokio::test]
    async fn close_candidate_ends_the_search() {
        let fixture = Fixture::new();
        let encoder = FakeEncoder::new(|params| match params.quality {
            100 => (Some(kib(600)), 10),
            95 => (Some(kib(520)), 20),
            _ => (Some(kib(480)), 30),
        });
        let tiers = vec![
            BatchTier::new(&[100, 95, 90], &[0], &[1]),
            BatchTier::new(&[80], &[60], &[2]),
        ];
        let mut cleanup = CleanupManager::new();

        let outcome = fixture
            .searcher(&encoder, tiers, &CancelFlag::new())
            .search(&fixture.frames, kib(500), &fixture.output, &mut cleanup)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SearchOutcome::Found(Candidate {
                path: fixture.output.clone(),
                size: kib(480),
            })
        );
        assert_eq!(encoder.launched_tiers(), BTreeSet::from(["tier_0".to_owned()]));

        assert_eq!(cleanup.finish(), 0);
        assert!(fixture.leftovers().is_empty());
        assert_eq!(std::fs::metadata(&fixture.output).unwrap().len(), kib(480));
    }

    #[tokio::test]
    async fn tier_entirely_within_target_stops_the_search() {
        let fixture = Fixture::new();
        let encoder = FakeEncoder::new(|params| match params.lossy {
            0 => (Some(500), 5),
            20 => (Some(600), 15),
            _ => (Some(700), 10),
        });
        let tiers = vec![
            BatchTier::new(&[100], &[0, 20, 40], &[1]),
            BatchTier::new(&[90], &[60], &[1]),
        ];
        let mut cleanup = CleanupManager::new();

        let outcome = fixture
            .searcher(&encoder, tiers, &CancelFlag::new())
            .search(&fixture.frames, 1000, &fixture.output, &mut cleanup)
            .await
            .unwrap();

        assert!(matches!(outcome, SearchOutcome::Found(ref found) if found.size == 700));
        assert_eq!(encoder.launched_tiers(), BTreeSet::from(["tier_0".to_owned()]));

        cleanup.finish();
        assert!(fixture.leftovers().is_empty());
    }

    #[tokio::test]
    async fn partial_fit_moves_to_the_next_tier() {
        let fixture = Fixture::new();
        let encoder = FakeEncoder::new(|params| match (params.quality, params.frame_skip) {
            (100, _) => (Some(1200), 5),
            (95, _) => (Some(800), 5),
            (_, 2) => (Some(990), 5),
            _ => (Some(900), 5),
        });
        let tiers = vec![
            BatchTier::new(&[100, 95], &[0], &[1]),
            BatchTier::new(&[80], &[60], &[1, 2]),
            BatchTier::new(&[70], &[80], &[3]),
        ];
        let mut cleanup = CleanupManager::new();

        let outcome = fixture
            .searcher(&encoder, tiers, &CancelFlag::new())
            .search(&fixture.frames, 1000, &fixture.output, &mut cleanup)
            .await
            .unwrap();

        assert!(matches!(outcome, SearchOutcome::Found(ref found) if found.size == 990));
        assert_eq!(
            encoder.launched_tiers(),
            BTreeSet::from(["tier_0".to_owned(), "tier_1".to_owned()])
        );

        cleanup.finish();
        assert!(fixture.leftovers().is_empty());
    }

    #[tokio::test]
    async fn failed_attempts_do_not_stop_the_search() {
        let fixture = Fixture::new();
        let encoder = FakeEncoder::new(|params| match params.quality {
            100 => (None, 5),
            _ => (Some(960), 5),
        });
        let tiers = vec![
            BatchTier::new(&[100], &[0, 20], &[1]),
            BatchTier::new(&[80], &[60], &[2]),
        ];
        let mut cleanup = CleanupManager::new();

        let outcome = fixture
            .searcher(&encoder, tiers, &CancelFlag::new())
            .search(&fixture.frames, 1000, &fixture.output, &mut cleanup)
            .await
            .unwrap();

        assert!(matches!(outcome, SearchOutcome::Found(ref found) if found.size == 960));

        cleanup.finish();
        assert!(fixture.leftovers().is_empty());
    }

    #[tokio::test]
    async fn nothing_under_target_is_not_found() {
        let fixture = Fixture::new();
        let encoder = FakeEncoder::new(|_params| (Some(5000), 5));
        let mut cleanup = CleanupManager::new();

        let outcome = fixture
            .searcher(&encoder, crate::tiers::default_tiers(), &CancelFlag::new())
            .search(&fixture.frames, 1000, &fixture.output, &mut cleanup)
            .await
            .unwrap();

        assert_eq!(outcome, SearchOutcome::NotFound);
        assert_eq!(encoder.launched_tiers().len(), 3);
        assert!(!fixture.output.exists());

        assert_eq!(cleanup.finish(), 0);
        assert!(fixture.leftovers().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_tier_reports_cancelled() {
        let fixture = Fixture::new();
        let encoder = FakeEncoder::new(|params| match params.lossy {
            0 => (Some(100), 5),
            _ => (Some(990), 30_000),
        });
        let tiers = vec![BatchTier::new(&[90], &[0, 20, 40], &[2])];
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let mut cleanup = CleanupManager::new();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = fixture
            .searcher(&encoder, tiers, &cancel)
            .search(&fixture.frames, 1000, &fixture.output, &mut cleanup)
            .await
            .unwrap();

        assert_eq!(outcome, SearchOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(encoder.launched.lock().unwrap().len(), 3);
        assert!(!fixture.output.exists());

        assert_eq!(cleanup.finish(), 0);
        assert!(fixture.leftovers().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_start_launches_nothing() {
        let fixture = Fixture::new();
        let encoder = FakeEncoder::new(|_params| (Some(100), 5));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut cleanup = CleanupManager::new();

        let outcome = fixture
            .searcher(&encoder, crate::tiers::default_tiers(), &cancel)
            .search(&fixture.frames, 1000, &fixture.output, &mut cleanup)
            .await
            .unwrap();

        assert_eq!(outcome, SearchOutcome::Cancelled);
        assert!(encoder.launched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_target_makes_one_maximum_quality_attempt() {
        let fixture = Fixture::new();
        let encoder = FakeEncoder::new(|_params| (Some(4321), 5));
        let mut cleanup = CleanupManager::new();

        let outcome = fixture
            .searcher(&encoder, crate::tiers::default_tiers(), &CancelFlag::new())
            .encode_maximum_quality(&fixture.frames, &fixture.output, &mut cleanup)
            .await
            .unwrap();

        assert!(matches!(outcome, SearchOutcome::Found(ref found) if found.size == 4321));

        {
            let launched = encoder.launched.lock().unwrap();
            assert_eq!(launched.len(), 1);
            assert_eq!(
                (launched[0].quality, launched[0].lossy, launched[0].frame_skip),
                (100, 0, 1)
            );
        }

        cleanup.finish();
        assert!(fixture.leftovers().is_empty());
    }

    #[tokio::test]
    async fn failed_maximum_quality_attempt_is_not_found() {
        let fixture = Fixture::new();
        let encoder = FakeEncoder::new(|_params| (None, 5));
        let mut cleanup = CleanupManager::new();

        let outcome = fixture
            .searcher(&encoder, crate::tiers::default_tiers(), &CancelFlag::new())
            .encode_maximum_quality(&fixture.frames, &fixture.output, &mut cleanup)
            .await
            .unwrap();

        assert_eq!(outcome, SearchOutcome::NotFound);
        assert_eq!(encoder.launched.lock().unwrap().len(), 1);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(SearchOutcome::NotFound.exit_code(), 2);
        assert_eq!(SearchOutcome::Cancelled.exit_code(), 130);
    }
}
