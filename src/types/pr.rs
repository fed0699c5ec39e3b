//! Pull request snapshot types.
//!
//! A [`PullRequest`] is an immutable per-cycle snapshot of an open pull
//! request together with the most recent comment the bot posted on it. It is
//! re-fetched at the start of every cycle and never persisted; the comment
//! thread on GitHub is the only cross-cycle memory this system has.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BranchName, PrNumber, RepoName, Sha};

/// Maximum length of the sanitized image moniker derived from a branch name.
const IMAGE_MONIKER_MAX_LEN: usize = 125;

/// An issue comment on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// The comment body text.
    pub body: String,

    /// Login of the comment author.
    pub author: String,

    /// When the comment was last updated.
    pub updated_at: DateTime<Utc>,
}

/// An immutable snapshot of an open pull request, taken once per cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// The repository the pull request belongs to.
    pub repo: RepoName,

    /// The pull request number.
    pub number: PrNumber,

    /// The pull request title.
    pub title: String,

    /// Login of the pull request author.
    pub author: String,

    /// The head branch (the branch the pull request wants merged).
    pub branch: BranchName,

    /// The head commit SHA at snapshot time.
    pub head_sha: Sha,

    /// When the pull request was last updated.
    pub updated_at: DateTime<Utc>,

    /// The most recent bot comment, if the bot has commented before.
    pub last_bot_comment: Option<Comment>,
}

impl PullRequest {
    /// Returns the human-readable description embedded in every comment the
    /// bot posts about this pull request.
    pub fn moniker(&self, github_org: &str) -> String {
        format!(
            "pull request {number} for [{repo}](https://github.com/{org}/{repo}), \
             submitted on branch [{branch}](https://github.com/{org}/{repo}/tree/{branch}) \
             at commit {sha}",
            number = self.number,
            repo = self.repo,
            org = github_org,
            branch = self.branch,
            sha = self.head_sha,
        )
    }

    /// Returns a container-image-safe moniker derived from the branch name.
    ///
    /// Runs of non-alphanumeric characters are collapsed to a single `-`,
    /// the result is lower-cased and truncated to a bounded length so it can
    /// be embedded in image tags and resource names.
    pub fn image_moniker(&self) -> String {
        let mut out = String::with_capacity(self.branch.as_str().len());
        let mut last_was_separator = false;
        for c in self.branch.as_str().chars() {
            if c.is_ascii_alphanumeric() {
                out.extend(c.to_lowercase());
                last_was_separator = false;
            } else if !last_was_separator {
                out.push('-');
                last_was_separator = true;
            }
        }
        out.truncate(IMAGE_MONIKER_MAX_LEN);
        out
    }
}
