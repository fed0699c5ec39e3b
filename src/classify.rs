//! Pull request lifecycle classification.
//!
//! Classification is pure: it looks only at the snapshot of a pull request
//! and its most recent bot comment, and derives whether the pull request
//! still wants a build (`Active`) or has already been built at its current
//! head commit (`Expired`).
//!
//! A pull request whose last bot comment mentions the current head commit
//! but does not carry the success marker (i.e. the last attempt failed) is
//! neither Active nor Expired: it is excluded from scheduling for the cycle
//! so a failing build is not retried until the author pushes a new commit.

use crate::notify::SUCCESS_MARKER;
use crate::types::PullRequest;

/// Derived lifecycle status of a pull request, recomputed every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The pull request wants a build at its current head commit.
    Active,

    /// The current head commit was already built successfully. The pull
    /// request only matters to the eviction scan now.
    Expired,
}

/// Classifies a pull request from its last bot comment.
///
/// - No bot comment, or a comment that does not mention the current head
///   SHA: the head is new, the pull request is [`Status::Active`].
/// - A comment mentioning the current head SHA and carrying the success
///   marker: already built, [`Status::Expired`].
/// - A comment mentioning the current head SHA without the success marker:
///   the last attempt failed at this commit; returns `None` and the pull
///   request sits out the cycle.
pub fn classify(pr: &PullRequest) -> Option<Status> {
    let comment = match &pr.last_bot_comment {
        None => return Some(Status::Active),
        Some(comment) => comment,
    };

    if !comment.body.contains(pr.head_sha.as_str()) {
        return Some(Status::Active);
    }

    if comment.body.contains(SUCCESS_MARKER) {
        return Some(Status::Expired);
    }

    None
}
