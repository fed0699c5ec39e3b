//! One-shot countdown latch for phase synchronization.
//!
//! Every slot task reports "phase 1 complete" to the latch exactly once per
//! cycle, whether or not its direct-affinity pick found a group. The latch
//! releases all fallback readers the moment the last slot has reported, and
//! never re-arms: a latch instance covers exactly one cycle.
//!
//! Implemented as an atomic countdown paired with a `watch` channel so that
//! any number of waiters can await the release and late waiters observe it
//! immediately.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;

/// A single-resolution barrier armed with a fixed arrival count.
#[derive(Debug)]
pub struct PhaseLatch {
    remaining: AtomicUsize,
    released: watch::Sender<bool>,
}

impl PhaseLatch {
    /// Creates a latch that releases after `count` arrivals.
    ///
    /// A latch armed with zero is released from the start.
    pub fn new(count: usize) -> Self {
        let (released, _) = watch::channel(count == 0);
        PhaseLatch {
            remaining: AtomicUsize::new(count),
            released,
        }
    }

    /// Records one arrival. The final arrival releases every waiter.
    ///
    /// Must be called at most `count` times per latch.
    pub fn arrive(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "more arrivals than the latch was armed for");
        if prev == 1 {
            // Receivers may not exist yet; the channel retains the value so
            // late subscribers still observe the release.
            let _ = self.released.send(true);
        }
    }

    /// Waits until every arrival has been recorded.
    ///
    /// Returns immediately if the latch has already been released.
    pub async fn wait(&self) {
        let mut rx = self.released.subscribe();
        // The sender lives inside `self`, so the channel cannot close while
        // we hold a reference to it.
        let _ = rx.wait_for(|released| *released).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn releases_after_all_arrivals() {
        let latch = Arc::new(PhaseLatch::new(3));

        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };

        latch.arrive();
        latch.arrive();
        assert!(!waiter.is_finished());

        latch.arrive();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("latch should release after the final arrival")
            .expect("waiter task should not panic");
    }

    #[tokio::test]
    async fn late_waiter_observes_release() {
        let latch = PhaseLatch::new(1);
        latch.arrive();
        // Must not hang even though the release happened before the wait.
        tokio::time::timeout(Duration::from_secs(1), latch.wait())
            .await
            .expect("released latch should not block");
    }

    #[tokio::test]
    async fn zero_count_latch_is_released_immediately() {
        let latch = PhaseLatch::new(0);
        tokio::time::timeout(Duration::from_secs(1), latch.wait())
            .await
            .expect("empty latch should start released");
    }

    #[tokio::test]
    async fn supports_many_waiters() {
        let latch = Arc::new(PhaseLatch::new(1));
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let latch = Arc::clone(&latch);
                tokio::spawn(async move { latch.wait().await })
            })
            .collect();

        latch.arrive();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("all waiters should release")
                .expect("waiter task should not panic");
        }
    }
}
