use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kubewarden_crds::PolicyServer;

use crate::config_document::{sources_document, PoliciesDocument};
use crate::constants::{POLICIES_CONFIG_KEY, SOURCES_CONFIG_KEY};
use crate::errors::Result;
use crate::resources::{child_labels, owner_reference};

/// The configmap carrying the policy-server configuration: the policies map
/// and the registry sources, both serialized as JSON. The data plane treats
/// this configmap as its sole source of truth and reloads on change.
pub fn desired_configmap(
    policy_server: &PolicyServer,
    deployment_namespace: &str,
    policies: &PoliciesDocument,
) -> Result<ConfigMap> {
    let sources = sources_document(&policy_server.spec);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(policy_server.name_with_prefix()),
            namespace: Some(deployment_namespace.to_string()),
            labels: Some(child_labels(policy_server)),
            owner_references: Some(owner_reference(policy_server)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (
                POLICIES_CONFIG_KEY.to_string(),
                serde_json::to_string(policies)?,
            ),
            (
                SOURCES_CONFIG_KEY.to_string(),
                serde_json::to_string(&sources)?,
            ),
        ])),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_document::policy_entry;
    use crate::constants::POLICY_SERVER_LABEL_KEY;
    use kubewarden_crds::{ClusterAdmissionPolicy, ClusterAdmissionPolicySpec, PolicyServerSpec};

    fn policy_server() -> PolicyServer {
        PolicyServer {
            metadata: ObjectMeta {
                name: Some("default".to_string()),
                uid: Some("b2c3d4".to_string()),
                ..Default::default()
            },
            spec: PolicyServerSpec {
                image: "ghcr.io/kubewarden/policy-server:v1.26.0".to_string(),
                replicas: 2,
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn configmap_contains_both_documents() {
        let mut policies = PoliciesDocument::new();
        let (name, entry) = policy_entry(&ClusterAdmissionPolicy {
            metadata: ObjectMeta {
                name: Some("p1".to_string()),
                ..Default::default()
            },
            spec: ClusterAdmissionPolicySpec {
                module: "registry://m:1".to_string(),
                ..Default::default()
            },
            status: None,
        });
        policies.insert(name, entry);

        let configmap = desired_configmap(&policy_server(), "kubewarden", &policies).unwrap();

        assert_eq!(
            configmap.metadata.name.as_deref(),
            Some("policy-server-default")
        );
        assert_eq!(configmap.metadata.namespace.as_deref(), Some("kubewarden"));
        assert_eq!(
            configmap.metadata.labels.as_ref().unwrap()[POLICY_SERVER_LABEL_KEY],
            "default"
        );

        let data = configmap.data.as_ref().unwrap();
        let policies_json: serde_json::Value =
            serde_json::from_str(&data[POLICIES_CONFIG_KEY]).unwrap();
        assert!(policies_json.get("clusterwide-p1").is_some());

        let sources_json: serde_json::Value =
            serde_json::from_str(&data[SOURCES_CONFIG_KEY]).unwrap();
        assert_eq!(sources_json["insecure_sources"], serde_json::json!([]));
        assert_eq!(sources_json["source_authorities"], serde_json::json!({}));
    }

    #[test]
    fn configmap_is_owned_by_the_policy_server() {
        let configmap =
            desired_configmap(&policy_server(), "kubewarden", &PoliciesDocument::new()).unwrap();
        let owners = configmap.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "PolicyServer");
        assert_eq!(owners[0].name, "default");
    }
}
