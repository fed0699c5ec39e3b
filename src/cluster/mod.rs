//! Cluster collaborator: the Kubernetes side of the system.
//!
//! Like the GitHub side, the scheduler core only sees the [`ClusterApi`]
//! trait. The real implementation ([`KubeCluster`]) talks to the cluster via
//! kube-rs; tests script condition sequences against a mock.
//!
//! The build job itself is opaque to the core: it is created, polled for a
//! terminal condition, and cleaned up. What the job actually does is the
//! cluster's business.

mod client;

pub use client::KubeCluster;

use std::collections::BTreeMap;
use std::future::Future;

use thiserror::Error;

use crate::types::DeploymentSlot;

/// Annotation carrying the branch a slot was last built from.
pub const BUILT_FROM_BRANCH_ANNOTATION: &str = "preview-slots/built-from-branch";

/// Annotation carrying a slot's display icon.
pub const CALL_SIGN_ANNOTATION: &str = "preview-slots/call-sign";

/// Label selecting the deployments that act as preview slots; its value is
/// the slot flavor.
pub const FLAVOR_LABEL: &str = "preview-slots/flavor";

/// Errors from cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The Kubernetes API call failed.
    #[error("kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// A manifest could not be built or a response could not be decoded.
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// A referenced object exists but is missing expected content.
    #[error("{0}")]
    Malformed(String),
}

/// The observable state of a build job's terminal condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildCondition {
    /// The job finished successfully.
    Succeeded,

    /// The job failed; `reason` is the cluster-reported reason string.
    Failed {
        /// Reason reported by the job's failed condition.
        reason: String,
    },

    /// The job has not reached a terminal state yet (condition missing or
    /// neither true nor false).
    Pending,
}

/// Everything needed to submit one build job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildJobSpec {
    /// The job object's name.
    pub name: String,

    /// The deployment the build targets.
    pub target_deployment: String,

    /// Sanitized branch-derived image moniker.
    pub image_moniker: String,

    /// The branch being built.
    pub branch: String,

    /// The head commit being built.
    pub commit_sha: String,

    /// Name of the workspace claim the job mounts.
    pub claim_name: String,

    /// Service account for the privileged pipeline tasks.
    pub privileged_service_account: String,

    /// Service account for the unprivileged preparation task.
    pub unprivileged_service_account: String,
}

/// The cluster operations the scheduler core consumes.
pub trait ClusterApi: Send + Sync {
    /// Lists the preview deployment slots of a namespace, sorted by
    /// last-deploy time ascending (oldest first).
    fn list_deployment_slots(
        &self,
        namespace: &str,
    ) -> impl Future<Output = Result<Vec<DeploymentSlot>, ClusterError>> + Send;

    /// Creates the ephemeral workspace claim a build job mounts.
    fn create_workspace_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Deletes a workspace claim by name.
    fn delete_workspace_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Submits a build job.
    fn create_build_job(
        &self,
        namespace: &str,
        spec: &BuildJobSpec,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Fetches a build job's terminal condition.
    fn get_build_condition(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<BuildCondition, ClusterError>> + Send;

    /// Deletes the transient pods a finished build job left behind.
    fn delete_build_pods(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Reads a namespaced secret, decoded to UTF-8 values.
    fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<BTreeMap<String, String>, ClusterError>> + Send;
}

impl<C: ClusterApi + ?Sized> ClusterApi for std::sync::Arc<C> {
    async fn list_deployment_slots(
        &self,
        namespace: &str,
    ) -> Result<Vec<DeploymentSlot>, ClusterError> {
        (**self).list_deployment_slots(namespace).await
    }

    async fn create_workspace_claim(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        (**self).create_workspace_claim(namespace, name).await
    }

    async fn delete_workspace_claim(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        (**self).delete_workspace_claim(namespace, name).await
    }

    async fn create_build_job(
        &self,
        namespace: &str,
        spec: &BuildJobSpec,
    ) -> Result<(), ClusterError> {
        (**self).create_build_job(namespace, spec).await
    }

    async fn get_build_condition(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BuildCondition, ClusterError> {
        (**self).get_build_condition(namespace, name).await
    }

    async fn delete_build_pods(&self, namespace: &str, job_name: &str) -> Result<(), ClusterError> {
        (**self).delete_build_pods(namespace, job_name).await
    }

    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClusterError> {
        (**self).read_secret(namespace, name).await
    }
}
