//! Outcome notifications posted as pull request comments.
//!
//! Comments are the system's only user-facing channel, and the success
//! comment doubles as the cross-cycle memory the classifier reads next
//! cycle: it must contain both the built commit SHA (via the moniker) and
//! [`SUCCESS_MARKER`]. Keep the marker and the success wording in sync or
//! expired pull requests will be rebuilt forever.
//!
//! Posting is best-effort per pull request: one failed comment is logged and
//! does not stop the remaining notifications.

use tracing::{debug, warn};

use crate::classify::{Status, classify};
use crate::github::SourceControl;
use crate::pool::BranchGroup;
use crate::types::{BranchName, PullRequest};

/// Marker text the classifier looks for to recognize a successful build
/// comment. Embedded verbatim in every success comment.
pub const SUCCESS_MARKER: &str = "was successfully built and is available";

/// Posts outcome comments on pull requests.
#[derive(Debug, Clone)]
pub struct Notifier<S> {
    source: S,
    github_org: String,
}

impl<S: SourceControl> Notifier<S> {
    /// Creates a notifier posting through `source`.
    pub fn new(source: S, github_org: impl Into<String>) -> Self {
        Notifier {
            source,
            github_org: github_org.into(),
        }
    }

    /// Tells every member of `group` its build is live at `build_url`.
    pub async fn success(&self, group: &BranchGroup, build_url: &str) {
        for pr in &group.pull_requests {
            let body = success_message(pr, &self.github_org, build_url);
            self.post(pr, &body).await;
        }
    }

    /// Tells every member of `group` its build failed, embedding `reason`.
    pub async fn failure(&self, group: &BranchGroup, reason: &str) {
        for pr in &group.pull_requests {
            let body = failure_message(pr, &self.github_org, reason);
            self.post(pr, &body).await;
        }
    }

    /// Tells every member of `group` it received no slot this cycle.
    pub async fn skipped(&self, group: &BranchGroup) {
        for pr in &group.pull_requests {
            let body = skipped_message(pr, &self.github_org);
            self.post(pr, &body).await;
        }
    }

    /// Scans `candidates` for pull requests evicted by a build of
    /// `winning_branch` into the slot serving `build_url`.
    ///
    /// A pull request is evicted when it is classified Expired, its last bot
    /// comment references `build_url` (it was previously told this slot held
    /// its build), and its own branch differs from `winning_branch` (the
    /// slot now serves someone else).
    pub async fn evicted(
        &self,
        candidates: &[PullRequest],
        build_url: &str,
        winning_branch: &BranchName,
    ) {
        for pr in candidates {
            if !is_evicted(pr, build_url, winning_branch) {
                continue;
            }
            debug!(pr = %pr.number, repo = %pr.repo, "Notifying evicted pull request");
            let body = evicted_message(pr, &self.github_org);
            self.post(pr, &body).await;
        }
    }

    async fn post(&self, pr: &PullRequest, body: &str) {
        if let Err(e) = self.source.create_comment(&pr.repo, pr.number, body).await {
            warn!(
                pr = %pr.number,
                repo = %pr.repo,
                error = %e,
                "Failed to post outcome comment"
            );
        }
    }
}

/// Returns true if `pr` should receive an eviction comment for a build of
/// `winning_branch` at `build_url`.
fn is_evicted(pr: &PullRequest, build_url: &str, winning_branch: &BranchName) -> bool {
    if classify(pr) != Some(Status::Expired) {
        return false;
    }
    let comment = match &pr.last_bot_comment {
        Some(comment) => comment,
        None => return false,
    };
    comment.body.contains(build_url) && &pr.branch != winning_branch
}

fn success_message(pr: &PullRequest, org: &str, build_url: &str) -> String {
    format!(
        "The {}, {SUCCESS_MARKER} at {build_url}.",
        pr.moniker(org)
    )
}

fn failure_message(pr: &PullRequest, org: &str, reason: &str) -> String {
    format!(
        "The {}, failed to build.\n\
         <details>\n<summary>Error details</summary>\n<pre>\n{reason}\n</pre>\n</details>\n",
        pr.moniker(org)
    )
}

fn skipped_message(pr: &PullRequest, org: &str) -> String {
    format!(
        "The {} was skipped, because too many other PRs were pending.",
        pr.moniker(org)
    )
}

fn evicted_message(pr: &PullRequest, org: &str) -> String {
    format!(
        "The {} was evicted by a more recent pull request.",
        pr.moniker(org)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::GitHubApiError;
    use crate::types::{Comment, PrNumber, RepoName, Sha};
    use chrono::Utc;
    use std::sync::Mutex;

    /// Records posted comments instead of hitting GitHub.
    #[derive(Default)]
    struct RecordingSource {
        posted: Mutex<Vec<(RepoName, PrNumber, String)>>,
    }

    impl SourceControl for &RecordingSource {
        async fn list_open_pull_requests(
            &self,
            _repo: &RepoName,
        ) -> Result<Vec<PullRequest>, GitHubApiError> {
            Ok(Vec::new())
        }

        async fn list_comments(
            &self,
            _repo: &RepoName,
            _number: PrNumber,
        ) -> Result<Vec<Comment>, GitHubApiError> {
            Ok(Vec::new())
        }

        async fn create_comment(
            &self,
            repo: &RepoName,
            number: PrNumber,
            body: &str,
        ) -> Result<(), GitHubApiError> {
            self.posted
                .lock()
                .unwrap()
                .push((repo.clone(), number, body.to_string()));
            Ok(())
        }
    }

    fn pr(number: u64, branch: &str, last_bot_comment: Option<&str>) -> PullRequest {
        PullRequest {
            repo: RepoName::from("website"),
            number: PrNumber(number),
            title: "change".to_string(),
            author: "alice".to_string(),
            branch: BranchName::from(branch),
            head_sha: Sha::new(format!("{number:040}")),
            updated_at: Utc::now(),
            last_bot_comment: last_bot_comment.map(|body| Comment {
                body: body.to_string(),
                author: "preview-slots[bot]".to_string(),
                updated_at: Utc::now(),
            }),
        }
    }

    fn group_of(prs: Vec<PullRequest>) -> BranchGroup {
        BranchGroup {
            branch: prs[0].branch.clone(),
            pull_requests: prs,
        }
    }

    #[tokio::test]
    async fn success_comment_contains_marker_sha_and_url() {
        let source = RecordingSource::default();
        let notifier = Notifier::new(&source, "example-org");
        let group = group_of(vec![pr(1, "feature-x", None)]);

        notifier.success(&group, "https://preview-a.example.org/").await;

        let posted = source.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        let body = &posted[0].2;
        assert!(body.contains(SUCCESS_MARKER));
        assert!(body.contains(&"0".repeat(39)));
        assert!(body.contains("https://preview-a.example.org/"));
    }

    #[tokio::test]
    async fn failure_comment_embeds_reason_in_details_block() {
        let source = RecordingSource::default();
        let notifier = Notifier::new(&source, "example-org");
        let group = group_of(vec![pr(1, "feature-x", None)]);

        notifier.failure(&group, "CouldntGetTask").await;

        let posted = source.posted.lock().unwrap();
        let body = &posted[0].2;
        assert!(body.contains("<details>"));
        assert!(body.contains("CouldntGetTask"));
        assert!(!body.contains(SUCCESS_MARKER));
    }

    #[tokio::test]
    async fn every_group_member_is_notified() {
        let source = RecordingSource::default();
        let notifier = Notifier::new(&source, "example-org");
        let group = group_of(vec![pr(1, "feature-x", None), pr(2, "feature-x", None)]);

        notifier.skipped(&group).await;

        let posted = source.posted.lock().unwrap();
        assert_eq!(posted.len(), 2);
    }

    #[tokio::test]
    async fn eviction_requires_expired_url_match_and_different_branch() {
        let source = RecordingSource::default();
        let notifier = Notifier::new(&source, "example-org");
        let url = "https://preview-a.example.org/";

        let expired_comment = |sha: &str| format!("commit {sha} {SUCCESS_MARKER} at {url}.");

        // Expired on another branch, told about this slot: evicted.
        let evicted = pr(1, "feature-old", Some(&expired_comment(&format!("{:040}", 1))));
        // Expired on the winning branch itself: stays.
        let winner = pr(2, "feature-new", Some(&expired_comment(&format!("{:040}", 2))));
        // Expired but pointing at a different slot: stays.
        let elsewhere = pr(
            3,
            "feature-other",
            Some(&format!(
                "commit {:040} {SUCCESS_MARKER} at https://preview-b.example.org/.",
                3
            )),
        );
        // Active pull request mentioning the URL: not expired, stays.
        let active = pr(4, "feature-live", None);

        notifier
            .evicted(
                &[evicted, winner, elsewhere, active],
                url,
                &BranchName::from("feature-new"),
            )
            .await;

        let posted = source.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].1, PrNumber(1));
        assert!(posted[0].2.contains("was evicted by a more recent pull request"));
    }
}
