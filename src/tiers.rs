use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::config::EncodeSettings;

/// Identifies one attempt of the search: which tier it belongs to and its index within that tier.
/// Every temporary path an attempt owns is derived from this key. Both indices are zero-based,
/// here and in every log line and path name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttemptKey {
    pub tier: usize,
    pub attempt: usize,
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "tier {} attempt {}", self.tier, self.attempt)
    }
}

impl AttemptKey {
    #[must_use]
    pub const fn new(tier: usize, attempt: usize) -> Self {
        Self { tier, attempt }
    }

    #[must_use]
    pub fn skip_directory_name(&self, frame_skip: usize) -> String {
        format!(
            "frames_skip_{frame_skip}_tier_{}_attempt_{}",
            self.tier, self.attempt
        )
    }

    #[must_use]
    pub fn candidate_file_name(&self) -> String {
        format!("attempt_{:03}.gif", self.attempt)
    }

    #[must_use]
    pub fn tier_directory_name(&self) -> String {
        tier_directory_name(self.tier)
    }
}

#[must_use]
pub fn tier_directory_name(tier: usize) -> String {
    format!("tier_{tier}")
}

/// Parameters for a single attempt. Lock settings are applied at construction and the value is
/// never changed afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptimizationParams {
    pub quality: u32,
    pub lossy: u32,
    pub frame_skip: usize,
    pub output_path: PathBuf,
}

impl OptimizationParams {
    #[must_use]
    pub fn new(
        quality: u32,
        lossy: u32,
        frame_skip: usize,
        output_path: PathBuf,
        settings: &EncodeSettings,
    ) -> Self {
        Self {
            quality: if settings.lock_quality { 100 } else { quality },
            lossy: if settings.lock_lossy { 0 } else { lossy },
            frame_skip: if settings.lock_frame_skip {
                1
            } else {
                frame_skip.max(1)
            },
            output_path,
        }
    }

    /// The single attempt used when no size budget is given.
    #[must_use]
    pub const fn maximum_quality(output_path: PathBuf) -> Self {
        Self {
            quality: 100,
            lossy: 0,
            frame_skip: 1,
            output_path,
        }
    }

    fn same_encode(&self, other: &Self) -> bool {
        self.quality == other.quality
            && self.lossy == other.lossy
            && self.frame_skip == other.frame_skip
    }
}

/// One band of the search. The attempts of a tier are the cross product of its three sets.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BatchTier {
    pub qualities: Vec<u32>,
    pub lossy_levels: Vec<u32>,
    pub frame_skips: Vec<usize>,
}

impl BatchTier {
    #[must_use]
    pub fn new(qualities: &[u32], lossy_levels: &[u32], frame_skips: &[usize]) -> Self {
        Self {
            qualities: qualities.to_vec(),
            lossy_levels: lossy_levels.to_vec(),
            frame_skips: frame_skips.to_vec(),
        }
    }

    /// Builds this tier's attempts with output files under `directory`.
    ///
    /// Combinations that collapse onto the same encode once the lock settings are applied are
    /// only attempted once; the first occurrence keeps its place.
    #[must_use]
    pub fn attempts(
        &self,
        tier: usize,
        directory: &Path,
        settings: &EncodeSettings,
    ) -> Vec<(AttemptKey, OptimizationParams)> {
        let mut attempts: Vec<(AttemptKey, OptimizationParams)> = vec![];

        for &quality in &self.qualities {
            for &lossy in &self.lossy_levels {
                for &frame_skip in &self.frame_skips {
                    let key = AttemptKey::new(tier, attempts.len());
                    let params = OptimizationParams::new(
                        quality,
                        lossy,
                        frame_skip,
                        directory.join(key.candidate_file_name()),
                        settings,
                    );

                    if attempts
                        .iter()
                        .all(|(_key, existing)| !existing.same_encode(&params))
                    {
                        attempts.push((key, params));
                    }
                }
            }
        }

        attempts
    }

    fn validate(&self, index: usize) -> anyhow::Result<()> {
        if self.qualities.is_empty() || self.lossy_levels.is_empty() || self.frame_skips.is_empty()
        {
            return Err(anyhow!("Tier {index} has an empty parameter set"));
        }

        if self.frame_skips.contains(&0) {
            return Err(anyhow!(
                "Tier {index} has a frame skip of 0 (use 1 to keep every frame)"
            ));
        }

        Ok(())
    }
}

/// Tiers ordered from the most faithful (and largest) encodes to the most aggressive.
#[must_use]
pub fn default_tiers() -> Vec<BatchTier> {
    vec![
        BatchTier::new(&[100, 95, 90], &[0, 20, 40], &[1]),
        BatchTier::new(&[90, 85, 80], &[60, 70, 80], &[1, 2]),
        BatchTier::new(&[80], &[60, 70, 80], &[2, 3, 4]),
    ]
}

pub fn load(path: &Path) -> anyhow::Result<Vec<BatchTier>> {
    let file = File::open(path).with_context(|| format!("Unable to open tier table {path:?}"))?;
    let reader = BufReader::new(file);

    let tiers: Vec<BatchTier> = serde_json::from_reader(reader)
        .with_context(|| format!("Unable to deserialize tier table from {path:?}"))?;

    if tiers.is_empty() {
        return Err(anyhow!("Tier table {path:?} does not define any tiers"));
    }

    for (index, tier) in tiers.iter().enumerate() {
        tier.validate(index)
            .with_context(|| format!("Invalid tier table {path:?}"))?;
    }

    Ok(tiers)
}
