use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kubewarden_crds::PolicyServer;

use crate::resources::{child_labels, owner_reference, pod_selector};

/// The PodDisruptionBudget protecting the policy-server pods. Only built
/// when the spec sets minAvailable or maxUnavailable (which are mutually
/// exclusive, enforced at the admission boundary).
pub fn desired_pdb(
    policy_server: &PolicyServer,
    deployment_namespace: &str,
) -> Option<PodDisruptionBudget> {
    if policy_server.spec.min_available.is_none() && policy_server.spec.max_unavailable.is_none() {
        return None;
    }

    Some(PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(policy_server.name_with_prefix()),
            namespace: Some(deployment_namespace.to_string()),
            labels: Some(child_labels(policy_server)),
            owner_references: Some(owner_reference(policy_server)),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: policy_server.spec.min_available.clone(),
            max_unavailable: policy_server.spec.max_unavailable.clone(),
            selector: Some(LabelSelector {
                match_labels: Some(pod_selector(policy_server)),
                match_expressions: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kubewarden_crds::PolicyServerSpec;
    use rstest::rstest;

    fn policy_server(
        min_available: Option<IntOrString>,
        max_unavailable: Option<IntOrString>,
    ) -> PolicyServer {
        PolicyServer {
            metadata: ObjectMeta {
                name: Some("default".to_string()),
                uid: Some("b2c3d4".to_string()),
                ..Default::default()
            },
            spec: PolicyServerSpec {
                image: "ghcr.io/kubewarden/policy-server:v1.26.0".to_string(),
                replicas: 3,
                min_available,
                max_unavailable,
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn no_pdb_without_disruption_settings() {
        assert!(desired_pdb(&policy_server(None, None), "kubewarden").is_none());
    }

    #[rstest]
    #[case(Some(IntOrString::Int(2)), None)]
    #[case(None, Some(IntOrString::String("20%".to_string())))]
    fn pdb_mirrors_the_spec_settings(
        #[case] min_available: Option<IntOrString>,
        #[case] max_unavailable: Option<IntOrString>,
    ) {
        let pdb = desired_pdb(
            &policy_server(min_available.clone(), max_unavailable.clone()),
            "kubewarden",
        )
        .unwrap();

        let spec = pdb.spec.as_ref().unwrap();
        assert_eq!(spec.min_available, min_available);
        assert_eq!(spec.max_unavailable, max_unavailable);
        assert_eq!(
            spec.selector.as_ref().unwrap().match_labels.as_ref().unwrap()
                ["kubewarden/policy-server"],
            "default"
        );
    }
}
