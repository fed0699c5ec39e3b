//! The slot scheduler: two-phase pick-and-build across all deployment slots.
//!
//! Every cycle, each slot runs an independent retry loop, all slots
//! concurrently. The loop has two phases:
//!
//! **Phase 1 (direct affinity).** The slot tries to consume the group for
//! the branch it was last built from. Whether or not that yields a group,
//! the slot immediately reports "phase 1 complete" to a shared countdown
//! latch. The latch fires once every slot has reported; no slot may touch
//! the fallback path before it fires. This is the ordering guarantee that
//! stops a slot with no direct match from racing ahead and stealing, via
//! fallback, a group that a slower slot was about to claim by affinity.
//!
//! **Phase 2 (fallback).** After the latch fires, the slot repeatedly
//! consumes the most recently updated remaining group and tries to build
//! it. A failed group is never returned to the pool; the loop ends on the
//! first success or when the pool is exhausted.
//!
//! After all slots finish, every group still in the pool was never picked
//! by anyone and its members are told they were skipped.


use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::build::{BuildOutcome, BuildRunner};
use crate::github::SourceControl;
use crate::notify::Notifier;
use crate::pool::{BranchGroup, GroupPool, PhaseLatch};
use crate::types::{DeploymentSlot, PullRequest};

/// Schedules pull request groups into deployment slots for one cycle at a
/// time.
pub struct SlotScheduler<R, S> {
    inner: Arc<Inner<R, S>>,
}

impl<R, S> Clone for SlotScheduler<R, S> {
    fn clone(&self) -> Self {
        SlotScheduler {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<R, S> {
    runner: R,
    notifier: Notifier<S>,
    preview_domain: String,
}

impl<R, S> SlotScheduler<R, S>
where
    R: BuildRunner + 'static,
    S: SourceControl + 'static,
{
    /// Creates a scheduler that builds through `runner` and reports through
    /// `notifier`.
    pub fn new(runner: R, notifier: Notifier<S>, preview_domain: impl Into<String>) -> Self {
        SlotScheduler {
            inner: Arc::new(Inner {
                runner,
                notifier,
                preview_domain: preview_domain.into(),
            }),
        }
    }

    /// Runs one scheduling cycle over `slots`.
    ///
    /// `active` becomes the cycle's grouping pool; `expired` is the eviction
    /// scan's candidate set. Returns when every slot task has finished and
    /// every leftover group has been notified as skipped.
    #[instrument(skip_all, fields(slots = slots.len(), active = active.len()))]
    pub async fn run_cycle(
        &self,
        slots: Vec<DeploymentSlot>,
        active: Vec<PullRequest>,
        expired: Vec<PullRequest>,
    ) {
        let pool = Arc::new(Mutex::new(GroupPool::new(active)));
        let latch = Arc::new(PhaseLatch::new(slots.len()));
        let expired = Arc::new(expired);

        let groups = pool.lock().await.len();
        info!(groups, "Starting slot assignment");

        let mut tasks = JoinSet::new();
        for slot in slots {
            let inner = Arc::clone(&self.inner);
            let pool = Arc::clone(&pool);
            let latch = Arc::clone(&latch);
            let expired = Arc::clone(&expired);
            tasks.spawn(async move {
                run_slot(inner, slot, pool, latch, expired).await;
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                // A panicking slot task must not take the cycle down with
                // it; the remaining slots and the skipped sweep still run.
                error!(error = %e, "Slot task failed");
            }
        }

        let leftover = pool.lock().await.drain_remaining();
        for group in leftover {
            debug!(branch = %group.branch, "Group received no slot, notifying skipped");
            self.inner.notifier.skipped(&group).await;
        }
    }
}

/// One slot's two-phase retry loop.
#[instrument(skip_all, fields(slot = %slot.name))]
async fn run_slot<R, S>(
    inner: Arc<Inner<R, S>>,
    slot: DeploymentSlot,
    pool: Arc<Mutex<GroupPool>>,
    latch: Arc<PhaseLatch>,
    expired: Arc<Vec<PullRequest>>,
) where
    R: BuildRunner,
    S: SourceControl,
{
    // Phase 1: direct affinity. The arrival must happen immediately after
    // the consume, before any build work, so other slots' fallback reads
    // are not held up by this slot's build.
    let direct = match &slot.built_from_branch {
        Some(branch) => pool.lock().await.consume_by_name(branch),
        None => None,
    };
    latch.arrive();

    if let Some(group) = direct {
        debug!(branch = %group.branch, "Direct affinity match");
        if attempt(&inner, &slot, group, &expired).await {
            return;
        }
    }

    // Phase 2: fallback. Gated on every slot having completed phase 1.
    latch.wait().await;
    loop {
        let group = pool.lock().await.consume_latest();
        match group {
            None => {
                debug!("Pool exhausted, slot ends without a build");
                return;
            }
            Some(group) => {
                debug!(branch = %group.branch, "Fallback pick");
                if attempt(&inner, &slot, group, &expired).await {
                    return;
                }
            }
        }
    }
}

/// Runs one build attempt and its notifications.
///
/// Returns true on success, ending the slot's loop.
async fn attempt<R, S>(
    inner: &Inner<R, S>,
    slot: &DeploymentSlot,
    group: BranchGroup,
    expired: &[PullRequest],
) -> bool
where
    R: BuildRunner,
    S: SourceControl,
{
    match inner.runner.build(slot, &group).await {
        BuildOutcome::Succeeded => {
            let build_url = slot.build_url(&inner.preview_domain);
            info!(branch = %group.branch, url = %build_url, "Build succeeded");
            inner.notifier.success(&group, &build_url).await;
            inner
                .notifier
                .evicted(expired, &build_url, &group.branch)
                .await;
            true
        }
        outcome => {
            let reason = outcome.failure_reason().unwrap_or("unknown failure");
            info!(branch = %group.branch, reason = %reason, "Build failed");
            inner.notifier.failure(&group, reason).await;
            false
        }
    }
}
