//! Counts live worker execution contexts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

static GLOBAL: LazyLock<ContextTracker> = LazyLock::new(ContextTracker::default);

/// Shared counter of worker contexts that have been spawned and not yet
/// exited. Tests hand a private tracker to a bridge and assert it drains to
/// zero after teardown.
#[derive(Debug, Clone, Default)]
pub struct ContextTracker {
    live: Arc<AtomicUsize>,
}

impl ContextTracker {
    /// Process-wide tracker used when none is configured.
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    pub fn outstanding(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn enter(&self) -> ContextGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        ContextGuard {
            live: Arc::clone(&self.live),
        }
    }
}

/// Decrements the tracker when the worker context ends.
#[derive(Debug)]
pub(crate) struct ContextGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_drop_decrements() {
        let tracker = ContextTracker::default();
        let a = tracker.enter();
        let b = tracker.enter();
        assert_eq!(tracker.outstanding(), 2);
        drop(a);
        assert_eq!(tracker.outstanding(), 1);
        drop(b);
        assert_eq!(tracker.outstanding(), 0);
    }
}
