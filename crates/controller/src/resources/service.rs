use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kubewarden_crds::PolicyServer;

use crate::constants::{
    POLICY_SERVER_LEGACY_PORT, POLICY_SERVER_LEGACY_PORT_NAME, POLICY_SERVER_METRICS_PORT,
    POLICY_SERVER_METRICS_PORT_NAME, POLICY_SERVER_PORT, POLICY_SERVER_PORT_NAME,
};
use crate::resources::{child_labels, owner_reference, pod_selector};

/// The ClusterIP service fronting the policy-server pods. Webhook client
/// configs point at port 8443; port 443 is kept for clients configured
/// before the port move.
pub fn desired_service(
    policy_server: &PolicyServer,
    deployment_namespace: &str,
    metrics_enabled: bool,
) -> Service {
    let mut ports = vec![
        ServicePort {
            name: Some(POLICY_SERVER_PORT_NAME.to_string()),
            port: POLICY_SERVER_PORT,
            target_port: Some(IntOrString::Int(POLICY_SERVER_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
        ServicePort {
            name: Some(POLICY_SERVER_LEGACY_PORT_NAME.to_string()),
            port: POLICY_SERVER_LEGACY_PORT,
            target_port: Some(IntOrString::Int(POLICY_SERVER_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
    ];
    if metrics_enabled {
        ports.push(ServicePort {
            name: Some(POLICY_SERVER_METRICS_PORT_NAME.to_string()),
            port: POLICY_SERVER_METRICS_PORT,
            target_port: Some(IntOrString::Int(POLICY_SERVER_METRICS_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }

    Service {
        metadata: ObjectMeta {
            name: Some(policy_server.name_with_prefix()),
            namespace: Some(deployment_namespace.to_string()),
            labels: Some(child_labels(policy_server)),
            owner_references: Some(owner_reference(policy_server)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(pod_selector(policy_server)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubewarden_crds::PolicyServerSpec;

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
    fn service_exposes_https_and_legacy_ports() {
        let service = desired_service(&policy_server(), "kubewarden", false);
        let ports = service.spec.as_ref().unwrap().ports.as_ref().unwrap();

        assert_eq!(ports.len(), 2);
        assert!(ports
            .iter()
            .any(|port| port.port == POLICY_SERVER_PORT
                && port.target_port == Some(IntOrString::Int(POLICY_SERVER_PORT))));
        assert!(ports
            .iter()
            .any(|port| port.port == POLICY_SERVER_LEGACY_PORT
                && port.target_port == Some(IntOrString::Int(POLICY_SERVER_PORT))));
    }

    #[test]
    fn metrics_port_appears_only_when_enabled() {
        let service = desired_service(&policy_server(), "kubewarden", true);
        let ports = service.spec.as_ref().unwrap().ports.as_ref().unwrap();
        assert!(ports
            .iter()
            .any(|port| port.port == POLICY_SERVER_METRICS_PORT));
    }

    #[test]
    fn selector_targets_the_policy_server_pods() {
        let service = desired_service(&policy_server(), "kubewarden", false);
        let selector = service.spec.as_ref().unwrap().selector.as_ref().unwrap();
        assert_eq!(selector["kubewarden/policy-server"], "default");
    }
}
