//! The outer cycle: fetch, classify, schedule.
//!
//! A cycle snapshots the world (deployment slots from the cluster, open pull
//! requests and their bot comments from GitHub), classifies every pull
//! request, and hands the result to the slot scheduler. Cycles run on a
//! fixed timer; a guard skips a tick whenever the previous cycle is still in
//! flight, so long builds never stack concurrent cycles.
//!
//! Failure isolation is deliberately asymmetric. Losing the slot list means
//! the cycle cannot do anything sensible and aborts. Losing one repository's
//! pull requests, or one pull request's comments, only drops that slice from
//! the snapshot; the rest of the cycle proceeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::build::BuildRunner;
use crate::classify::{Status, classify};
use crate::cluster::{ClusterApi, ClusterError};
use crate::github::{SourceControl, latest_bot_comment};
use crate::scheduler::SlotScheduler;
use crate::types::{PullRequest, RepoName};

/// Drives scheduling cycles against a cluster and a source-control host.
pub struct CycleRunner<C, R, S> {
    inner: Arc<Inner<C, R, S>>,
}

impl<C, R, S> Clone for CycleRunner<C, R, S> {
    fn clone(&self) -> Self {
        CycleRunner {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C, R, S> {
    cluster: C,
    source: S,
    scheduler: SlotScheduler<R, S>,
    repositories: Vec<RepoName>,
    namespace: String,
    bot_login: String,
    in_flight: AtomicBool,
}

impl<C, R, S> CycleRunner<C, R, S>
where
    C: ClusterApi + 'static,
    R: BuildRunner + 'static,
    S: SourceControl + 'static,
{
    pub fn new(
        cluster: C,
        source: S,
        scheduler: SlotScheduler<R, S>,
        repositories: Vec<RepoName>,
        namespace: impl Into<String>,
        bot_login: impl Into<String>,
    ) -> Self {
        CycleRunner {
            inner: Arc::new(Inner {
                cluster,
                source,
                scheduler,
                repositories,
                namespace: namespace.into(),
                bot_login: bot_login.into(),
                in_flight: AtomicBool::new(false),
            }),
        }
    }

    /// Runs cycles forever on a fixed `period`.
    ///
    /// Each tick launches a cycle as its own task; the in-flight guard makes
    /// an overlapping tick a no-op rather than a concurrent cycle.
    pub async fn run_forever(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let runner = self.clone();
            tokio::spawn(async move {
                runner.run_guarded().await;
            });
        }
    }

    /// Runs one cycle unless the previous one is still in flight.
    pub async fn run_guarded(&self) {
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Previous cycle still in flight, skipping this tick");
            return;
        }
        if let Err(e) = self.run_cycle().await {
            error!(error = %e, "Cycle aborted");
        }
        self.inner.in_flight.store(false, Ordering::Release);
    }

    /// Runs one full cycle.
    ///
    /// Errors only when the slot inventory cannot be listed; source-control
    /// failures are isolated per repository and per pull request.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self) -> Result<(), ClusterError> {
        let slots = self
            .inner
            .cluster
            .list_deployment_slots(&self.inner.namespace)
            .await?;
        let (active, expired) = self.collect_pull_requests().await;
        info!(
            slots = slots.len(),
            active = active.len(),
            expired = expired.len(),
            "Cycle snapshot complete"
        );
        self.inner.scheduler.run_cycle(slots, active, expired).await;
        Ok(())
    }

    /// Fetches and classifies every watched repository's open pull requests.
    ///
    /// Returns `(active, expired)`. Pull requests classified as neither
    /// (their current commit already failed to build) sit the cycle out.
    async fn collect_pull_requests(&self) -> (Vec<PullRequest>, Vec<PullRequest>) {
        let mut active = Vec::new();
        let mut expired = Vec::new();

        for repo in &self.inner.repositories {
            let pulls = match self.inner.source.list_open_pull_requests(repo).await {
                Ok(pulls) => pulls,
                Err(e) => {
                    warn!(repo = %repo, error = %e, "Failed to list pull requests, skipping repository");
                    continue;
                }
            };
            for mut pr in pulls {
                let comments = match self.inner.source.list_comments(repo, pr.number).await {
                    Ok(comments) => comments,
                    Err(e) => {
                        warn!(
                            repo = %repo,
                            pr = %pr.number,
                            error = %e,
                            "Failed to list comments, skipping pull request"
                        );
                        continue;
                    }
                };
                pr.last_bot_comment = latest_bot_comment(comments, &self.inner.bot_login);
                match classify(&pr) {
                    Some(Status::Active) => active.push(pr),
                    Some(Status::Expired) => expired.push(pr),
                    None => {
                        debug!(repo = %repo, pr = %pr.number, "Pull request sits this cycle out")
                    }
                }
            }
        }

        (active, expired)
    }
}
