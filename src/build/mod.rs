//! The build state machine.
//!
//! Drives one external build job from creation to a terminal outcome:
//!
//! ```text
//! Created -> Submitted -> Polling -> Succeeded | Failed(reason) | TimedOut
//! ```
//!
//! Creation provisions an ephemeral workspace claim and submits a build job
//! referencing it. After a fixed grace delay (so the cluster has registered
//! the job), the job's terminal condition is polled at a fixed interval for a
//! bounded number of iterations.
//!
//! Cluster API errors during creation or polling are not distinguished from
//! an explicit job failure: either way the attempt failed and the slot
//! scheduler moves on to its fallback pick. The workspace claim and the
//! job's transient pods are cleaned up on every terminal outcome, success or
//! not; cleanup failures are logged and do not change the outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{BuildCondition, BuildJobSpec, ClusterApi};
use crate::pool::BranchGroup;
use crate::types::DeploymentSlot;

/// Grace delay between submitting a job and the first status poll.
const GRACE_DELAY: Duration = Duration::from_secs(60);

/// Interval between status polls.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum number of pending polls before the attempt times out.
const MAX_POLL_ITERATIONS: u32 = 30;

/// Prefix for build job names.
const JOB_NAME_PREFIX: &str = "preview-build";

/// Prefix for workspace claim names.
const CLAIM_NAME_PREFIX: &str = "build-scratch";

/// Reason reported when the poll bound is exceeded.
pub const TIMEOUT_REASON: &str = "build did not complete in time";

/// Terminal outcome of one build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The build finished and the slot now serves the group's branch.
    Succeeded,

    /// The build failed; `reason` is suitable for embedding verbatim in a
    /// failure comment.
    Failed {
        /// Human-readable failure reason.
        reason: String,
    },

    /// The build did not reach a terminal condition within the poll bound.
    TimedOut,
}

impl BuildOutcome {
    /// Returns the failure reason for non-successful outcomes.
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            BuildOutcome::Succeeded => None,
            BuildOutcome::Failed { reason } => Some(reason),
            BuildOutcome::TimedOut => Some(TIMEOUT_REASON),
        }
    }
}

/// The build seam the slot scheduler drives.
///
/// [`BuildMachine`] is the real implementation; tests substitute scripted
/// runners so scheduling scenarios need no cluster at all.
pub trait BuildRunner: Send + Sync {
    /// Runs one build attempt of `group` into `slot` to a terminal outcome.
    fn build(
        &self,
        slot: &DeploymentSlot,
        group: &BranchGroup,
    ) -> impl Future<Output = BuildOutcome> + Send;
}

impl<R: BuildRunner + ?Sized> BuildRunner for Arc<R> {
    async fn build(&self, slot: &DeploymentSlot, group: &BranchGroup) -> BuildOutcome {
        (**self).build(slot, group).await
    }
}

impl<C: ClusterApi> BuildRunner for BuildMachine<C> {
    async fn build(&self, slot: &DeploymentSlot, group: &BranchGroup) -> BuildOutcome {
        self.run(slot, group).await
    }
}

/// Runs build attempts against a cluster.
#[derive(Debug, Clone)]
pub struct BuildMachine<C> {
    cluster: C,
    namespace: String,
    privileged_service_account: String,
    unprivileged_service_account: String,
}

impl<C: ClusterApi> BuildMachine<C> {
    /// Creates a build machine for a namespace.
    pub fn new(
        cluster: C,
        namespace: impl Into<String>,
        privileged_service_account: impl Into<String>,
        unprivileged_service_account: impl Into<String>,
    ) -> Self {
        BuildMachine {
            cluster,
            namespace: namespace.into(),
            privileged_service_account: privileged_service_account.into(),
            unprivileged_service_account: unprivileged_service_account.into(),
        }
    }

    /// Runs one build attempt of `group` into `slot` to a terminal outcome.
    ///
    /// Never fails: cluster errors become a `Failed` outcome for this
    /// attempt.
    #[instrument(skip(self, group), fields(slot = %slot.name, branch = %group.branch))]
    pub async fn run(&self, slot: &DeploymentSlot, group: &BranchGroup) -> BuildOutcome {
        let claim_name = format!("{CLAIM_NAME_PREFIX}-{}-{}", random_suffix(), slot.flavor);

        info!(
            claim = %claim_name,
            members = group.pull_requests.len(),
            "Scheduling branch into slot {} {}",
            slot.name,
            slot.call_sign,
        );

        if let Err(e) = self
            .cluster
            .create_workspace_claim(&self.namespace, &claim_name)
            .await
        {
            // Nothing was provisioned, so there is nothing to clean up.
            warn!(error = %e, "Failed to create workspace claim");
            return BuildOutcome::Failed {
                reason: e.to_string(),
            };
        }

        let spec = self.job_spec(slot, group, &claim_name);
        let outcome = match self.cluster.create_build_job(&self.namespace, &spec).await {
            Err(e) => {
                warn!(error = %e, job = %spec.name, "Failed to submit build job");
                BuildOutcome::Failed {
                    reason: e.to_string(),
                }
            }
            Ok(()) => {
                debug!(job = %spec.name, "Build job submitted, waiting grace delay");
                tokio::time::sleep(GRACE_DELAY).await;
                self.poll_to_completion(&spec.name).await
            }
        };

        self.cleanup(&spec.name, &claim_name).await;

        debug!(job = %spec.name, outcome = ?outcome, "Build attempt finished");
        outcome
    }

    /// Polls the job's terminal condition until it resolves or the bound is
    /// exceeded.
    async fn poll_to_completion(&self, job_name: &str) -> BuildOutcome {
        let mut iteration = 0u32;
        loop {
            let condition = match self.cluster.get_build_condition(&self.namespace, job_name).await
            {
                Ok(condition) => condition,
                Err(e) => {
                    warn!(error = %e, job = %job_name, "Failed to poll build job");
                    return BuildOutcome::Failed {
                        reason: e.to_string(),
                    };
                }
            };

            match condition {
                BuildCondition::Succeeded => return BuildOutcome::Succeeded,
                BuildCondition::Failed { reason } => return BuildOutcome::Failed { reason },
                BuildCondition::Pending => {
                    if iteration >= MAX_POLL_ITERATIONS {
                        return BuildOutcome::TimedOut;
                    }
                    iteration += 1;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Best-effort removal of the attempt's transient pods and workspace
    /// claim. Runs on every terminal outcome.
    async fn cleanup(&self, job_name: &str, claim_name: &str) {
        if let Err(e) = self.cluster.delete_build_pods(&self.namespace, job_name).await {
            warn!(error = %e, job = %job_name, "Failed to delete build pods");
        }
        if let Err(e) = self
            .cluster
            .delete_workspace_claim(&self.namespace, claim_name)
            .await
        {
            warn!(error = %e, claim = %claim_name, "Failed to delete workspace claim");
        }
    }

    fn job_spec(&self, slot: &DeploymentSlot, group: &BranchGroup, claim_name: &str) -> BuildJobSpec {
        let lead = group.lead();
        let stamp = Utc::now().format("%Y%m%d-%H%Mz");
        BuildJobSpec {
            name: format!("{JOB_NAME_PREFIX}-{}-{}", slot.flavor, stamp),
            target_deployment: slot.name.clone(),
            image_moniker: lead.image_moniker(),
            branch: lead.branch.as_str().to_string(),
            commit_sha: lead.head_sha.as_str().to_string(),
            claim_name: claim_name.to_string(),
            privileged_service_account: self.privileged_service_account.clone(),
            unprivileged_service_account: self.unprivileged_service_account.clone(),
        }
    }
}

/// Returns a short random fragment safe for RFC 1123 resource names.
fn random_suffix() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterError;
    use crate::types::{BranchName, PrNumber, PullRequest, RepoName, Sha};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Scripted cluster: answers polls from a queue and records calls.
    #[derive(Default)]
    struct MockCluster {
        conditions: Mutex<Vec<BuildCondition>>,
        calls: Mutex<Vec<String>>,
        fail_claim_creation: bool,
    }

    impl MockCluster {
        fn with_conditions(conditions: Vec<BuildCondition>) -> Self {
            MockCluster {
                conditions: Mutex::new(conditions),
                ..Default::default()
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ClusterApi for &MockCluster {
        async fn list_deployment_slots(
            &self,
            _namespace: &str,
        ) -> Result<Vec<DeploymentSlot>, ClusterError> {
            Ok(Vec::new())
        }

        async fn create_workspace_claim(
            &self,
            _namespace: &str,
            name: &str,
        ) -> Result<(), ClusterError> {
            self.record(format!("create_claim {name}"));
            if self.fail_claim_creation {
                return Err(ClusterError::Malformed("quota exceeded".to_string()));
            }
            Ok(())
        }

        async fn delete_workspace_claim(
            &self,
            _namespace: &str,
            name: &str,
        ) -> Result<(), ClusterError> {
            self.record(format!("delete_claim {name}"));
            Ok(())
        }

        async fn create_build_job(
            &self,
            _namespace: &str,
            spec: &BuildJobSpec,
        ) -> Result<(), ClusterError> {
            self.record(format!("create_job {}", spec.name));
            Ok(())
        }

        async fn get_build_condition(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<BuildCondition, ClusterError> {
            self.record("poll");
            let mut conditions = self.conditions.lock().unwrap();
            if conditions.is_empty() {
                Ok(BuildCondition::Pending)
            } else {
                Ok(conditions.remove(0))
            }
        }

        async fn delete_build_pods(
            &self,
            _namespace: &str,
            job_name: &str,
        ) -> Result<(), ClusterError> {
            self.record(format!("delete_pods {job_name}"));
            Ok(())
        }

        async fn read_secret(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<BTreeMap<String, String>, ClusterError> {
            Ok(BTreeMap::new())
        }
    }

    fn slot() -> DeploymentSlot {
        DeploymentSlot {
            name: "preview-a".to_string(),
            flavor: "standard".to_string(),
            call_sign: "🦀".to_string(),
            last_deploy: None,
            built_from_branch: None,
        }
    }

    fn group() -> BranchGroup {
        BranchGroup {
            branch: BranchName::from("feature-x"),
            pull_requests: vec![PullRequest {
                repo: RepoName::from("website"),
                number: PrNumber(1),
                title: "change".to_string(),
                author: "alice".to_string(),
                branch: BranchName::from("feature-x"),
                head_sha: Sha::new("a".repeat(40)),
                updated_at: Utc::now(),
                last_bot_comment: None,
            }],
        }
    }

    fn machine(cluster: &MockCluster) -> BuildMachine<&MockCluster> {
        BuildMachine::new(cluster, "preview", "pipeline", "preview-builder")
    }

    #[tokio::test(start_paused = true)]
    async fn successful_condition_yields_succeeded() {
        let cluster = MockCluster::with_conditions(vec![
            BuildCondition::Pending,
            BuildCondition::Succeeded,
        ]);
        let outcome = machine(&cluster).run(&slot(), &group()).await;
        assert_eq!(outcome, BuildOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_condition_carries_the_reported_reason() {
        let cluster = MockCluster::with_conditions(vec![BuildCondition::Failed {
            reason: "CouldntGetTask".to_string(),
        }]);
        let outcome = machine(&cluster).run(&slot(), &group()).await;
        assert_eq!(
            outcome,
            BuildOutcome::Failed {
                reason: "CouldntGetTask".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pending_past_the_bound_times_out() {
        // The mock answers Pending forever; the machine must give up.
        let cluster = MockCluster::default();
        let outcome = machine(&cluster).run(&slot(), &group()).await;
        assert_eq!(outcome, BuildOutcome::TimedOut);
        assert_eq!(outcome.failure_reason(), Some(TIMEOUT_REASON));

        // Initial check plus one per bounded iteration.
        let polls = cluster.calls().iter().filter(|c| *c == "poll").count();
        assert_eq!(polls as u32, MAX_POLL_ITERATIONS + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_runs_on_success_and_failure() {
        for conditions in [
            vec![BuildCondition::Succeeded],
            vec![BuildCondition::Failed {
                reason: "x".to_string(),
            }],
        ] {
            let cluster = MockCluster::with_conditions(conditions);
            machine(&cluster).run(&slot(), &group()).await;
            let calls = cluster.calls();
            assert!(calls.iter().any(|c| c.starts_with("delete_pods")));
            assert!(calls.iter().any(|c| c.starts_with("delete_claim")));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn claim_creation_failure_is_a_failed_attempt_without_cleanup() {
        let cluster = MockCluster {
            fail_claim_creation: true,
            ..Default::default()
        };
        let outcome = machine(&cluster).run(&slot(), &group()).await;
        assert!(matches!(outcome, BuildOutcome::Failed { .. }));
        let calls = cluster.calls();
        assert!(!calls.iter().any(|c| c.starts_with("delete_claim")));
    }

    #[test]
    fn random_suffix_is_name_safe() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
