//! Source-control collaborator: the GitHub side of the system.
//!
//! The scheduler core never talks to octocrab directly; it goes through the
//! [`SourceControl`] trait so tests can substitute an in-memory
//! implementation. The real implementation is [`OrgClient`], an octocrab
//! wrapper with transient-error retry.

mod client;
mod error;
mod retry;

pub use client::OrgClient;
pub use error::{GitHubApiError, GitHubErrorKind};
pub use retry::{RetryConfig, retry_with_backoff};

use std::future::Future;

use crate::types::{Comment, PrNumber, PullRequest, RepoName};

/// The source-control operations the scheduler core consumes.
///
/// Implementations are expected to supply their own authentication; the core
/// never observes tokens or refresh state.
pub trait SourceControl: Send + Sync {
    /// Lists the open pull requests of a repository.
    ///
    /// The returned snapshots have `last_bot_comment` unset; the cycle fills
    /// it from [`SourceControl::list_comments`].
    fn list_open_pull_requests(
        &self,
        repo: &RepoName,
    ) -> impl Future<Output = Result<Vec<PullRequest>, GitHubApiError>> + Send;

    /// Lists all issue comments on a pull request.
    fn list_comments(
        &self,
        repo: &RepoName,
        number: PrNumber,
    ) -> impl Future<Output = Result<Vec<Comment>, GitHubApiError>> + Send;

    /// Posts a comment on a pull request.
    fn create_comment(
        &self,
        repo: &RepoName,
        number: PrNumber,
        body: &str,
    ) -> impl Future<Output = Result<(), GitHubApiError>> + Send;
}

impl<S: SourceControl + ?Sized> SourceControl for std::sync::Arc<S> {
    async fn list_open_pull_requests(
        &self,
        repo: &RepoName,
    ) -> Result<Vec<PullRequest>, GitHubApiError> {
        (**self).list_open_pull_requests(repo).await
    }

    async fn list_comments(
        &self,
        repo: &RepoName,
        number: PrNumber,
    ) -> Result<Vec<Comment>, GitHubApiError> {
        (**self).list_comments(repo, number).await
    }

    async fn create_comment(
        &self,
        repo: &RepoName,
        number: PrNumber,
        body: &str,
    ) -> Result<(), GitHubApiError> {
        (**self).create_comment(repo, number, body).await
    }
}

/// Picks the most recently updated comment authored by the bot.
pub fn latest_bot_comment(comments: Vec<Comment>, bot_login: &str) -> Option<Comment> {
    comments
        .into_iter()
        .filter(|comment| comment.author == bot_login)
        .max_by_key(|comment| comment.updated_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn comment(author: &str, body: &str, secs: i64) -> Comment {
        Comment {
            body: body.to_string(),
            author: author.to_string(),
            updated_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn latest_bot_comment_ignores_other_authors() {
        let comments = vec![
            comment("alice", "nice work", 300),
            comment("preview-slots[bot]", "built", 100),
        ];
        let latest = latest_bot_comment(comments, "preview-slots[bot]").unwrap();
        assert_eq!(latest.body, "built");
    }

    #[test]
    fn latest_bot_comment_picks_newest() {
        let comments = vec![
            comment("preview-slots[bot]", "old", 100),
            comment("preview-slots[bot]", "new", 200),
        ];
        let latest = latest_bot_comment(comments, "preview-slots[bot]").unwrap();
        assert_eq!(latest.body, "new");
    }

    #[test]
    fn latest_bot_comment_none_when_bot_never_commented() {
        let comments = vec![comment("alice", "hi", 100)];
        assert!(latest_bot_comment(comments, "preview-slots[bot]").is_none());
    }
}
