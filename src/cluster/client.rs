//! kube-rs implementation of the cluster collaborator.
//!
//! Build jobs are Tekton `PipelineRun` objects, handled as `DynamicObject`s
//! because Tekton's types are a foreign CRD. Slot inventory comes from
//! Deployments carrying the flavor label; the last-deploy timestamp of a slot
//! is the creation timestamp of its newest owned ReplicaSet.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use kube::Client;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams,
};

use crate::types::{BranchName, DeploymentSlot};

use super::{
    BUILT_FROM_BRANCH_ANNOTATION, BuildCondition, BuildJobSpec, CALL_SIGN_ANNOTATION,
    ClusterApi, ClusterError, FLAVOR_LABEL,
};

/// Name of the pipeline every build job references.
const PIPELINE_NAME: &str = "preview-base-build";

/// Storage class for ephemeral build workspaces.
const WORKSPACE_STORAGE_CLASS: &str = "preview-nfs-build";

/// Requested size of a build workspace.
const WORKSPACE_STORAGE_SIZE: &str = "50Mi";

/// Secret holding registry push credentials, mounted into every build job.
const REGISTRY_PUSH_SECRET: &str = "registry-push";

/// Tekton's pod label tying a pod to the pipeline run that created it.
const PIPELINE_RUN_POD_LABEL: &str = "tekton.dev/pipelineRun";

/// A cluster client backed by kube-rs.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    build_job_resource: ApiResource,
}

impl KubeCluster {
    /// Creates a client from the ambient kubeconfig (in-cluster service
    /// account or `~/.kube/config`).
    pub async fn from_default_config() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    /// Creates a client from an existing kube client.
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("tekton.dev", "v1", "PipelineRun");
        KubeCluster {
            client,
            build_job_resource: ApiResource::from_gvk(&gvk),
        }
    }

    fn build_jobs(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.build_job_resource)
    }
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

impl ClusterApi for KubeCluster {
    async fn list_deployment_slots(
        &self,
        namespace: &str,
    ) -> Result<Vec<DeploymentSlot>, ClusterError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let replica_sets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);

        let deployments = deployments.list(&ListParams::default()).await?;
        let replica_sets = replica_sets.list(&ListParams::default()).await?;

        let mut slots: Vec<DeploymentSlot> = deployments
            .items
            .into_iter()
            .filter_map(|deployment| slot_from_deployment(deployment, &replica_sets.items))
            .collect();

        // Oldest slot first: slots never rolled out sort before everything.
        slots.sort_by_key(|slot| slot.last_deploy);
        Ok(slots)
    }

    async fn create_workspace_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let claim: PersistentVolumeClaim = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": { "name": name, "namespace": namespace },
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "storageClassName": WORKSPACE_STORAGE_CLASS,
                "resources": { "requests": { "storage": WORKSPACE_STORAGE_SIZE } },
            },
        }))?;
        claims.create(&PostParams::default(), &claim).await?;
        Ok(())
    }

    async fn delete_workspace_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        claims.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_build_job(
        &self,
        namespace: &str,
        spec: &BuildJobSpec,
    ) -> Result<(), ClusterError> {
        let manifest = serde_json::json!({
            "apiVersion": "tekton.dev/v1",
            "kind": "PipelineRun",
            "metadata": { "name": spec.name, "namespace": namespace },
            "spec": {
                "taskRunTemplate": {
                    "serviceAccountName": spec.privileged_service_account,
                },
                "taskRunSpecs": [{
                    "pipelineTaskName": "prep",
                    "serviceAccountName": spec.unprivileged_service_account,
                }],
                "pipelineRef": { "name": PIPELINE_NAME },
                "params": [
                    { "name": "explicit-stem", "value": spec.image_moniker },
                    { "name": "target-deployment", "value": spec.target_deployment },
                    { "name": "branch-name", "value": spec.branch },
                    { "name": "commit-sha", "value": spec.commit_sha },
                ],
                "workspaces": [
                    {
                        "name": "shared-workspace",
                        "persistentVolumeClaim": { "claimName": spec.claim_name },
                    },
                    {
                        "name": "dockerconfig",
                        "secret": { "secretName": REGISTRY_PUSH_SECRET },
                    },
                ],
            },
        });
        let job: DynamicObject = serde_json::from_value(manifest)?;
        self.build_jobs(namespace)
            .create(&PostParams::default(), &job)
            .await?;
        Ok(())
    }

    async fn get_build_condition(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BuildCondition, ClusterError> {
        let job = self.build_jobs(namespace).get(name).await?;
        Ok(condition_from_status(&job.data))
    }

    async fn delete_build_pods(&self, namespace: &str, job_name: &str) -> Result<(), ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{PIPELINE_RUN_POD_LABEL}={job_name}");
        pods.delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(&selector),
        )
        .await?;
        Ok(())
    }

    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClusterError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get(name).await?;
        let data = secret
            .data
            .ok_or_else(|| ClusterError::Malformed(format!("secret {name} has no data")))?;
        Ok(data
            .into_iter()
            .map(|(key, bytes)| (key, String::from_utf8_lossy(&bytes.0).into_owned()))
            .collect())
    }
}

/// Builds a slot from a deployment, if it carries the flavor label.
fn slot_from_deployment(
    deployment: Deployment,
    replica_sets: &[ReplicaSet],
) -> Option<DeploymentSlot> {
    let name = deployment.metadata.name.clone()?;
    let labels = deployment.metadata.labels.as_ref()?;
    let flavor = labels.get(FLAVOR_LABEL).filter(|f| !f.is_empty())?.clone();

    let annotations = deployment.metadata.annotations.as_ref();
    let built_from_branch = annotations
        .and_then(|a| a.get(BUILT_FROM_BRANCH_ANNOTATION))
        .filter(|b| !b.is_empty())
        .map(|b| BranchName::new(b.clone()));
    let call_sign = annotations
        .and_then(|a| a.get(CALL_SIGN_ANNOTATION))
        .cloned()
        .unwrap_or_default();

    let last_deploy = replica_sets
        .iter()
        .filter(|rs| is_owned_by_deployment(rs, &name))
        .filter_map(|rs| rs.metadata.creation_timestamp.as_ref())
        .map(|time| time.0)
        .max();

    Some(DeploymentSlot {
        name,
        flavor,
        call_sign,
        last_deploy,
        built_from_branch,
    })
}

fn is_owned_by_deployment(rs: &ReplicaSet, deployment_name: &str) -> bool {
    rs.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| {
            owners
                .iter()
                .any(|owner| owner.kind == "Deployment" && owner.name == deployment_name)
        })
}

/// Extracts the terminal condition from a build job's status block.
///
/// A missing status, a missing `Succeeded`-type condition, or a condition
/// whose status is neither `"True"` nor `"False"` all mean the job is still
/// running.
fn condition_from_status(data: &serde_json::Value) -> BuildCondition {
    let conditions = match data["status"]["conditions"].as_array() {
        Some(conditions) => conditions,
        None => return BuildCondition::Pending,
    };

    for condition in conditions {
        if condition["type"].as_str() != Some("Succeeded") {
            continue;
        }
        return match condition["status"].as_str() {
            Some("True") => BuildCondition::Succeeded,
            Some("False") => BuildCondition::Failed {
                reason: condition["reason"].as_str().unwrap_or("unknown").to_string(),
            },
            _ => BuildCondition::Pending,
        };
    }

    BuildCondition::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn condition_true_is_succeeded() {
        let data = json!({
            "status": { "conditions": [
                { "type": "Succeeded", "status": "True", "reason": "Completed" }
            ]}
        });
        assert_eq!(condition_from_status(&data), BuildCondition::Succeeded);
    }

    #[test]
    fn condition_false_carries_reason() {
        let data = json!({
            "status": { "conditions": [
                { "type": "Succeeded", "status": "False", "reason": "CouldntGetTask" }
            ]}
        });
        assert_eq!(
            condition_from_status(&data),
            BuildCondition::Failed {
                reason: "CouldntGetTask".to_string()
            }
        );
    }

    #[test]
    fn unknown_condition_is_pending() {
        let data = json!({
            "status": { "conditions": [
                { "type": "Succeeded", "status": "Unknown", "reason": "Running" }
            ]}
        });
        assert_eq!(condition_from_status(&data), BuildCondition::Pending);
    }

    #[test]
    fn missing_status_is_pending() {
        assert_eq!(condition_from_status(&json!({})), BuildCondition::Pending);
    }

    #[test]
    fn unrelated_condition_types_are_ignored() {
        let data = json!({
            "status": { "conditions": [
                { "type": "Ready", "status": "True" }
            ]}
        });
        assert_eq!(condition_from_status(&data), BuildCondition::Pending);
    }
}
