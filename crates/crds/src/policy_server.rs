use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, PodSecurityContext, ResourceRequirements, SecurityContext, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;

/// Security contexts applied to the policy-server pod and container.
#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyServerSecurity {
    /// securityContext definition to be used in the policy server container.
    pub container: Option<SecurityContext>,

    /// podSecurityContext definition to be used in the policy server pod.
    pub pod: Option<PodSecurityContext>,
}

/// Desired state of a pool of policy-evaluator replicas. Policies bind to a
/// PolicyServer by name; deleting a PolicyServer is blocked while bound
/// policies exist.
#[derive(
    Clone,
    CustomResource,
    Debug,
    Default,
    PartialEq,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "PolicyServer",
    plural = "policyservers",
    shortname = "ps",
    status = "PolicyServerStatus"
)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct PolicyServerSpec {
    /// Affinity rules for scheduling the policy server pods.
    pub affinity: Option<Affinity>,

    /// Annotations is an unstructured key value map stored with a resource
    /// that may be set by external tools to store and retrieve arbitrary
    /// metadata. They are not queryable and should be preserved when
    /// modifying objects.
    pub annotations: Option<BTreeMap<String, String>>,

    /// Env defines the environment variables of the policy server container.
    pub env: Option<Vec<EnvVar>>,

    /// Docker image name.
    pub image: String,

    /// Name of an image pull secret of type kubernetes.io/dockerconfigjson,
    /// used to pull policies from authenticated registries. It must be in
    /// the same namespace as the Kubewarden deployment.
    pub image_pull_secret: Option<String>,

    /// List of insecure URIs to policy repositories. The `insecureSources`
    /// content format corresponds with the contents of the `insecure_sources`
    /// key in `sources.yaml`.
    pub insecure_sources: Option<Vec<String>>,

    /// An eviction is allowed if maxUnavailable or fewer pods selected by
    /// the policy server deployment are unavailable after the eviction.
    /// Mutually exclusive with minAvailable.
    pub max_unavailable: Option<IntOrString>,

    /// An eviction is allowed if at least minAvailable pods selected by the
    /// policy server deployment will still be available after the eviction.
    /// Mutually exclusive with maxUnavailable.
    pub min_available: Option<IntOrString>,

    /// Number of desired pods.
    pub replicas: i32,

    /// Resources defines the resource requests and limits of the policy
    /// server container.
    pub resources: Option<ResourceRequirements>,

    /// SecurityContexts defines the security contexts of the policy server
    /// pod and container. When unset, the policy server runs as non-root
    /// with a read-only root filesystem and all capabilities dropped.
    pub security_contexts: Option<PolicyServerSecurity>,

    /// Name of the service account associated with the policy server.
    /// Namespace service account will be used if not specified.
    pub service_account_name: Option<String>,

    /// Registry authorities, a map of URIs to lists of PEM encoded
    /// certificates. The `sourceAuthorities` content format corresponds with
    /// the contents of the `source_authorities` key in `sources.yaml`.
    pub source_authorities: Option<HashMap<String, Vec<String>>>,

    /// Tolerations of the policy server pods.
    pub tolerations: Option<Vec<Toleration>>,

    /// Name of a configmap containing a Kubewarden verification config, to
    /// verify the signatures of the policies loaded by this server.
    pub verification_config: Option<String>,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyServerStatus {
    /// Conditions represent the observed conditions of the PolicyServer
    /// children reconciliation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl PolicyServer {
    /// The prefix shared by every child object: configmap, deployment,
    /// service and certificate secret all answer to this name.
    pub fn name_with_prefix(&self) -> String {
        format!(
            "policy-server-{}",
            self.metadata.name.clone().unwrap_or_default()
        )
    }
}
