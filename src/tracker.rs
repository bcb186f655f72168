use crate::encoder::Candidate;

/// A candidate within this fraction of the target ends the search.
pub const ACCEPTABLE_TOLERANCE: f64 = 0.05;

/// Keeps the candidate closest to the target size without going over it.
///
/// Only strictly closer candidates replace the current best, so among equal sizes the first one
/// seen wins. Since nothing over the target is ever kept, being closer means being larger and
/// the final best size does not depend on the order candidates arrive in.
#[derive(Clone, Debug)]
pub struct BestResultTracker {
    target: u64,
    best: Option<Candidate>,
}

impl BestResultTracker {
    #[must_use]
    pub const fn new(target: u64) -> Self {
        Self { target, best: None }
    }

    #[must_use]
    pub const fn target(&self) -> u64 {
        self.target
    }

    /// Returns whether `candidate` became the new best.
    pub fn consider(&mut self, candidate: &Candidate) -> bool {
        if candidate.size > self.target {
            return false;
        }

        let distance = self.target - candidate.size;

        let closer = self
            .best
            .as_ref()
            .map_or(true, |best| distance < self.target - best.size);

        if closer {
            self.best = Some(candidate.clone());
        }

        closer
    }

    /// Whether the current best is within `tolerance` of the target, as a fraction of it.
    #[allow(clippy::as_conversions)]
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn is_acceptable(&self, tolerance: f64) -> bool {
        self.best.as_ref().is_some_and(|best| {
            ((self.target - best.size) as f64) / (self.target as f64) < tolerance
        })
    }

    #[must_use]
    pub const fn best(&self) -> Option<&Candidate> {
        self.best.as_ref()
    }

    #[must_use]
    pub fn into_best(self) -> Option<Candidate> {
        self.best
    }
}
