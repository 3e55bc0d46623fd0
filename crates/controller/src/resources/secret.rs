use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kubewarden_crds::PolicyServer;

use crate::certs::{server_cert_secret_data, CertificatePair};
use crate::constants::{SERVER_CERT_KEY, SERVER_PRIVATE_KEY_KEY};
use crate::resources::{child_labels, owner_reference};

/// The per-server certificate secret, holding a leaf signed by the current
/// root CA with SAN `<prefix>.<namespace>.svc`.
pub fn desired_cert_secret(
    policy_server: &PolicyServer,
    deployment_namespace: &str,
    pair: &CertificatePair,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(policy_server.name_with_prefix()),
            namespace: Some(deployment_namespace.to_string()),
            labels: Some(child_labels(policy_server)),
            owner_references: Some(owner_reference(policy_server)),
            ..Default::default()
        },
        data: Some(server_cert_secret_data(pair)),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// The DNS name the per-server certificate must answer to.
pub fn server_cert_san(policy_server: &PolicyServer, deployment_namespace: &str) -> String {
    format!(
        "{}.{}.svc",
        policy_server.name_with_prefix(),
        deployment_namespace
    )
}

/// Whether an existing secret still carries both certificate and key.
/// Content-level verification (expiry, SAN, issuer) is the certificate
/// reconciler's job; the workload reconciler only repairs missing or
/// truncated secrets.
pub fn cert_secret_is_complete(secret: &Secret) -> bool {
    secret
        .data
        .as_ref()
        .map(|data| data.contains_key(SERVER_CERT_KEY) && data.contains_key(SERVER_PRIVATE_KEY_KEY))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::CertificateAuthority;
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
    fn san_follows_service_dns_shape() {
        assert_eq!(
            server_cert_san(&policy_server(), "kubewarden"),
            "policy-server-default.kubewarden.svc"
        );
    }

    #[test]
    fn secret_carries_cert_and_key() {
        let ca = CertificateAuthority::generate().unwrap();
        let pair = ca
            .sign_server_cert("policy-server-default.kubewarden.svc")
            .unwrap();

        let secret = desired_cert_secret(&policy_server(), "kubewarden", &pair);
        assert!(cert_secret_is_complete(&secret));
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("policy-server-default")
        );
    }

    #[test]
    fn incomplete_secret_is_detected() {
        assert!(!cert_secret_is_complete(&Secret::default()));
    }
}
