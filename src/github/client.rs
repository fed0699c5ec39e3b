//! Octocrab client wrapper scoped to a single GitHub organization.
//!
//! All repositories in the slot inventory live in one organization, so the
//! client carries the organization name and is handed bare repository names
//! by its callers. Every listing call goes through the retry layer so a
//! rate-limit blip does not abort the scheduling cycle.

use chrono::{DateTime, Utc};
use octocrab::Octocrab;

use crate::types::{Comment, PrNumber, PullRequest, RepoName, Sha};

use super::SourceControl;
use super::error::GitHubApiError;
use super::retry::{RetryConfig, retry_with_backoff};

/// Page size for GitHub list endpoints.
const PAGE_SIZE: u8 = 100;

/// A GitHub API client scoped to one organization.
#[derive(Clone)]
pub struct OrgClient {
    /// The underlying octocrab client.
    client: Octocrab,

    /// The organization all repository names are resolved against.
    org: String,

    /// Retry configuration applied to every call.
    retry: RetryConfig,
}

impl OrgClient {
    /// Creates a client from a personal access token.
    pub fn from_token(
        token: impl Into<String>,
        org: impl Into<String>,
    ) -> Result<Self, octocrab::Error> {
        let client = Octocrab::builder().personal_token(token.into()).build()?;
        Ok(Self::new(client, org))
    }

    /// Creates a client from a pre-configured octocrab instance.
    ///
    /// Use this when a different authentication scheme (e.g. a GitHub App
    /// installation token) is needed.
    pub fn new(client: Octocrab, org: impl Into<String>) -> Self {
        OrgClient {
            client,
            org: org.into(),
            retry: RetryConfig::DEFAULT,
        }
    }

    /// Returns the organization this client is scoped to.
    pub fn org(&self) -> &str {
        &self.org
    }

    async fn list_pulls_page(
        &self,
        repo: &RepoName,
        page: u32,
    ) -> Result<Vec<octocrab::models::pulls::PullRequest>, GitHubApiError> {
        self.client
            .pulls(&self.org, repo.as_str())
            .list()
            .state(octocrab::params::State::Open)
            .per_page(PAGE_SIZE)
            .page(page)
            .send()
            .await
            .map(|page| page.items)
            .map_err(GitHubApiError::from_octocrab)
    }

    async fn list_comments_page(
        &self,
        repo: &RepoName,
        number: PrNumber,
        page: u32,
    ) -> Result<Vec<octocrab::models::issues::Comment>, GitHubApiError> {
        self.client
            .issues(&self.org, repo.as_str())
            .list_comments(number.0)
            .per_page(PAGE_SIZE)
            .page(page)
            .send()
            .await
            .map(|page| page.items)
            .map_err(GitHubApiError::from_octocrab)
    }
}

impl std::fmt::Debug for OrgClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrgClient")
            .field("org", &self.org)
            .finish_non_exhaustive()
    }
}

impl SourceControl for OrgClient {
    async fn list_open_pull_requests(
        &self,
        repo: &RepoName,
    ) -> Result<Vec<PullRequest>, GitHubApiError> {
        let mut page = 1u32;
        let mut all = Vec::new();

        loop {
            let items =
                retry_with_backoff(self.retry, || self.list_pulls_page(repo, page)).await?;
            let is_last_page = items.len() < PAGE_SIZE as usize;

            for pull in items {
                all.push(snapshot_from_api(repo, pull));
            }

            if is_last_page {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn list_comments(
        &self,
        repo: &RepoName,
        number: PrNumber,
    ) -> Result<Vec<Comment>, GitHubApiError> {
        let mut page = 1u32;
        let mut all = Vec::new();

        loop {
            let items =
                retry_with_backoff(self.retry, || self.list_comments_page(repo, number, page))
                    .await?;
            let is_last_page = items.len() < PAGE_SIZE as usize;

            for comment in items {
                all.push(Comment {
                    body: comment.body.unwrap_or_default(),
                    author: comment.user.login,
                    updated_at: comment.updated_at.unwrap_or(comment.created_at),
                });
            }

            if is_last_page {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn create_comment(
        &self,
        repo: &RepoName,
        number: PrNumber,
        body: &str,
    ) -> Result<(), GitHubApiError> {
        retry_with_backoff(self.retry, || async {
            self.client
                .issues(&self.org, repo.as_str())
                .create_comment(number.0, body)
                .await
                .map(|_| ())
                .map_err(GitHubApiError::from_octocrab)
        })
        .await
    }
}

/// Maps an API pull request to the cycle snapshot type.
///
/// The last bot comment is filled in later by the cycle, which fetches the
/// comment thread separately.
fn snapshot_from_api(repo: &RepoName, pull: octocrab::models::pulls::PullRequest) -> PullRequest {
    let updated_at: DateTime<Utc> = pull
        .updated_at
        .or(pull.created_at)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    PullRequest {
        repo: repo.clone(),
        number: PrNumber(pull.number),
        title: pull.title.unwrap_or_default(),
        author: pull.user.map(|user| user.login).unwrap_or_default(),
        branch: crate::types::BranchName::new(pull.head.ref_field),
        head_sha: Sha::new(pull.head.sha),
        updated_at,
        last_bot_comment: None,
    }
}
