//! Per-cycle grouping pool of active pull requests.
//!
//! The pool groups the cycle's Active pull requests by branch name. Each
//! group can be consumed exactly once: after a consume operation returns a
//! group, the branch is gone for the rest of the cycle. The pool therefore
//! shrinks monotonically, which is what makes the two-phase slot assignment
//! race-free once access is serialized behind a mutex.
//!
//! The pool itself is a plain data structure; callers share it behind a
//! `tokio::sync::Mutex` so no two slot tasks ever hold it at once.

mod latch;

pub use latch::PhaseLatch;

use chrono::{DateTime, Utc};

use crate::types::{BranchName, PullRequest};

/// A non-empty group of pull requests sharing one branch name.
///
/// Groups may span repositories: grouping keys purely on the branch name, so
/// same-named branches in different repositories are built together as one
/// unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchGroup {
    /// The branch all members share.
    pub branch: BranchName,

    /// Members in ascending update-time order. Never empty.
    pub pull_requests: Vec<PullRequest>,
}

impl BranchGroup {
    /// Returns the update time of the most recently updated member.
    ///
    /// This is the group's priority for the fallback pick.
    pub fn latest_update(&self) -> DateTime<Utc> {
        self.pull_requests
            .iter()
            .map(|pr| pr.updated_at)
            .max()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Returns the lead pull request, whose branch and commit drive the build.
    pub fn lead(&self) -> &PullRequest {
        &self.pull_requests[0]
    }
}

/// The cycle's consumable mapping from branch name to pull request group.
#[derive(Debug, Default)]
pub struct GroupPool {
    /// Groups in first-encountered order; order breaks ties in
    /// [`GroupPool::consume_latest`].
    groups: Vec<BranchGroup>,
}

impl GroupPool {
    /// Builds the pool from the cycle's Active pull requests.
    ///
    /// Requests are sorted by ascending update time before grouping, so each
    /// group's members keep that relative order and the group order reflects
    /// the oldest member of each branch.
    pub fn new(mut active: Vec<PullRequest>) -> Self {
        active.sort_by_key(|pr| pr.updated_at);

        let mut groups: Vec<BranchGroup> = Vec::new();
        for pr in active {
            match groups.iter_mut().find(|g| g.branch == pr.branch) {
                Some(group) => group.pull_requests.push(pr),
                None => groups.push(BranchGroup {
                    branch: pr.branch.clone(),
                    pull_requests: vec![pr],
                }),
            }
        }

        GroupPool { groups }
    }

    /// Returns and removes the group for `branch`, if still present.
    pub fn consume_by_name(&mut self, branch: &BranchName) -> Option<BranchGroup> {
        let index = self.groups.iter().position(|g| &g.branch == branch)?;
        Some(self.groups.remove(index))
    }

    /// Returns and removes the group whose most recently updated member has
    /// the greatest update time.
    ///
    /// Exact ties keep the first-encountered group. Returns `None` once the
    /// pool is empty.
    pub fn consume_latest(&mut self) -> Option<BranchGroup> {
        let mut best: Option<(usize, DateTime<Utc>)> = None;
        for (index, group) in self.groups.iter().enumerate() {
            let latest = group.latest_update();
            // Strictly greater: an equal timestamp keeps the earlier group.
            if best.map_or(true, |(_, best_latest)| latest > best_latest) {
                best = Some((index, latest));
            }
        }
        best.map(|(index, _)| self.groups.remove(index))
    }

    /// Removes and returns every remaining group, for the skipped sweep.
    pub fn drain_remaining(&mut self) -> Vec<BranchGroup> {
        std::mem::take(&mut self.groups)
    }

    /// Returns the number of groups still present.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if every group has been consumed.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
