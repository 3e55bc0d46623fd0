//! The synchronization barrier behind the `PolicyUniquelyReachable`
//! condition. A policy may only report itself active once every live pod of
//! its policy server serves the configuration revision that includes it;
//! otherwise surviving old-revision replicas would reject or miss requests
//! depending on the failure policy.

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};

use crate::constants::{
    CONFIG_VERSION_ANNOTATION, DEPLOYMENT_REVISION_ANNOTATION, POD_TEMPLATE_HASH_LABEL_KEY,
    POLICIES_CONFIG_KEY,
};

/// Whether the policy identified by `unique_name` is served by every live
/// pod of its policy server. All of the following must hold:
///
/// - the configmap's current `policies.yml` contains `unique_name`;
/// - a ReplicaSet matches both the deployment's current revision and the
///   configmap's `resourceVersion` (propagated as the config-version
///   annotation);
/// - every pod of the policy server carries that ReplicaSet's
///   pod-template-hash, is Ready, and is not terminating.
pub fn policy_uniquely_reachable(
    configmap: &ConfigMap,
    deployment: &Deployment,
    replica_sets: &[ReplicaSet],
    pods: &[Pod],
    unique_name: &str,
) -> bool {
    if !configmap_contains_policy(configmap, unique_name) {
        return false;
    }

    let Some(config_version) = configmap.metadata.resource_version.as_deref() else {
        return false;
    };

    let Some(pod_template_hash) =
        latest_replica_set_template_hash(deployment, replica_sets, config_version)
    else {
        return false;
    };

    if pods.is_empty() {
        return false;
    }

    pods.iter().all(|pod| {
        pod_carries_template_hash(pod, &pod_template_hash)
            && pod_is_ready(pod)
            && pod.metadata.deletion_timestamp.is_none()
    })
}

pub fn configmap_contains_policy(configmap: &ConfigMap, unique_name: &str) -> bool {
    parse_policies_data(configmap)
        .map(|policies| policies.contains_key(unique_name))
        .unwrap_or(false)
}

/// The raw `policies.yml` map carried by the configmap, if parseable.
pub fn parse_policies_data(
    configmap: &ConfigMap,
) -> Option<serde_json::Map<String, serde_json::Value>> {
    let raw = configmap.data.as_ref()?.get(POLICIES_CONFIG_KEY)?;
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    match value {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Finds the ReplicaSet that carries both the deployment's current revision
/// and the wanted config-version annotation, and returns its
/// pod-template-hash label.
fn latest_replica_set_template_hash(
    deployment: &Deployment,
    replica_sets: &[ReplicaSet],
    config_version: &str,
) -> Option<String> {
    let deployment_revision = deployment
        .metadata
        .annotations
        .as_ref()?
        .get(DEPLOYMENT_REVISION_ANNOTATION)?;

    replica_sets
        .iter()
        .find(|rs| {
            let annotations = rs.metadata.annotations.as_ref();
            let revision_matches = annotations
                .and_then(|a| a.get(DEPLOYMENT_REVISION_ANNOTATION))
                .is_some_and(|revision| revision == deployment_revision);
            let config_matches = annotations
                .and_then(|a| a.get(CONFIG_VERSION_ANNOTATION))
                .is_some_and(|version| version == config_version);
            revision_matches && config_matches
        })
        .and_then(|rs| {
            rs.metadata
                .labels
                .as_ref()?
                .get(POD_TEMPLATE_HASH_LABEL_KEY)
                .cloned()
        })
}

fn pod_carries_template_hash(pod: &Pod, pod_template_hash: &str) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(POD_TEMPLATE_HASH_LABEL_KEY))
        .is_some_and(|hash| hash == pod_template_hash)
}

pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

/// Whether the deployment (and therefore its pod template) was stamped with
/// the configmap revision it is supposed to serve. Feeds the
/// `PolicyServerConfigurationUpToDate` condition.
pub fn deployment_config_version(deployment: &Deployment) -> Option<&str> {
    deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(CONFIG_VERSION_ANNOTATION))
        .map(String::as_str)
}
