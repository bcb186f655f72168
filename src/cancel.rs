use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Error used to unwind a step that stopped because cancellation was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "operation was cancelled")
    }
}

impl std::error::Error for Cancelled {}

#[derive(Debug, Default)]
struct Signal {
    set: AtomicBool,
    parent: Option<Arc<Signal>>,
}

impl Signal {
    fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst) || self.parent.as_ref().is_some_and(|parent| parent.is_set())
    }
}

/// Shared stop signal observed by every long-running step of a conversion.
///
/// Clones share the same signal. A [`child`](Self::child) flag reports cancellation when either
/// it or any of its ancestors has been cancelled, which lets one search tier stop its own
/// attempts without touching the run as a whole.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    signal: Arc<Signal>,
}

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            signal: Arc::new(Signal {
                set: AtomicBool::new(false),
                parent: Some(Arc::clone(&self.signal)),
            }),
        }
    }

    pub fn cancel(&self) {
        self.signal.set.store(true, Ordering::SeqCst);
    }

    /// Clears this flag. Ancestors are left alone.
    pub fn reset(&self) {
        self.signal.set.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_set()
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();

        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
        assert_eq!(other.check(), Err(Cancelled));
    }

    #[test]
    fn child_follows_parent_but_not_the_reverse() {
        let parent = CancelFlag::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn reset_clears_for_next_run() {
        let flag = CancelFlag::new();
        flag.cancel();
        flag.reset();

        assert!(!flag.is_cancelled());
        assert!(flag.check().is_ok());
    }

    #[test]
    fn cancelled_error_survives_context() {
        let error = anyhow::Error::from(Cancelled).context("Unable to run gifski");

        assert!(error.is::<Cancelled>());
    }
}
