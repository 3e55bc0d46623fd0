use std::collections::BTreeSet;

use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::CustomResource;

use crate::policies::common::{
    default_policy_server, default_settings, ContextAwareResource, FailurePolicy, MatchPolicy,
    PolicyMode, PolicyStatus, SideEffects,
};
use crate::policies::{Policy, PolicyScope};

/// A cluster-wide admission policy backed by a single WASM module.
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
    kind = "ClusterAdmissionPolicy",
    plural = "clusteradmissionpolicies",
    shortname = "cap",
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct ClusterAdmissionPolicySpec {
    /// AllowInsideKubewardenNamespace lets the policy also evaluate requests
    /// that target the namespace the Kubewarden stack is deployed in. Enable
    /// with care: a misbehaving policy can lock the stack out of its own
    /// namespace.
    #[serde(default)]
    pub allow_inside_kubewarden_namespace: bool,

    /// ContextAwareResources lists the cluster resources this policy is
    /// allowed to read at evaluation time.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub context_aware_resources: BTreeSet<ContextAwareResource>,

    /// FailurePolicy defines how unrecognized errors and timeout errors from
    /// the policy are handled.
    pub failure_policy: Option<FailurePolicy>,

    /// MatchConditions are a list of conditions that must be met for a
    /// request to be validated. Match conditions filter requests that have
    /// already been matched by the rules, namespaceSelector, and
    /// objectSelector.
    pub match_conditions: Option<Vec<MatchCondition>>,

    /// matchPolicy defines how the "rules" list is used to match incoming
    /// requests.
    pub match_policy: Option<MatchPolicy>,

    /// Mode defines the execution mode of this policy. Can be set to either
    /// "protect" or "monitor". If it's empty, it is defaulted to "protect".
    /// Transitioning this setting from "monitor" to "protect" is allowed,
    /// but is disallowed to transition from "protect" to "monitor". To
    /// perform this transition, the policy should be recreated in "monitor"
    /// mode instead.
    pub mode: Option<PolicyMode>,

    /// Module is the location of the WASM module to be loaded. Can be a
    /// local file (file://), a remote file served by an HTTP server
    /// (http://, https://), or an artifact served by an OCI-compatible
    /// registry (registry://).
    pub module: String,

    /// Mutating indicates whether a policy has the ability to mutate
    /// incoming requests or not.
    #[serde(default)]
    pub mutating: bool,

    /// NamespaceSelector decides whether to run the webhook on an object
    /// based on whether the namespace for that object matches the selector.
    pub namespace_selector: Option<LabelSelector>,

    /// ObjectSelector decides whether to run the webhook based on if the
    /// object has matching labels.
    pub object_selector: Option<LabelSelector>,

    /// identifies an existing PolicyServer resource
    #[serde(default = "default_policy_server")]
    pub policy_server: String,

    /// Rules describes what operations on what resources/subresources the
    /// webhook cares about. The webhook cares about an operation if it
    /// matches any Rule.
    pub rules: Option<Vec<RuleWithOperations>>,

    /// Settings is a free-form object that contains the policy configuration
    /// values.
    #[serde(default = "default_settings")]
    pub settings: RawExtension,

    /// SideEffects states whether this webhook has side effects.
    /// Acceptable values are: None, NoneOnDryRun.
    pub side_effects: Option<SideEffects>,

    /// TimeoutSeconds specifies the timeout for this webhook. After the
    /// timeout passes, the webhook call will be ignored or the API call will
    /// fail based on the failure policy. The timeout value must be between 1
    /// and 30 seconds. Default to 10 seconds.
    pub timeout_seconds: Option<i32>,
}

impl Policy for ClusterAdmissionPolicy {
    fn policy_server(&self) -> &str {
        &self.spec.policy_server
    }

    fn unique_name(&self) -> String {
        format!("clusterwide-{}", self.name())
    }

    fn scope(&self) -> PolicyScope {
        PolicyScope::Cluster
    }

    fn name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    fn namespace(&self) -> Option<String> {
        None
    }

    fn mode(&self) -> PolicyMode {
        self.spec.mode.clone().unwrap_or_default()
    }

    fn status(&self) -> Option<&PolicyStatus> {
        self.status.as_ref()
    }

    fn rules(&self) -> &[RuleWithOperations] {
        self.spec.rules.as_deref().unwrap_or_default()
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.spec.failure_policy.clone().unwrap_or_default()
    }

    fn match_policy(&self) -> MatchPolicy {
        self.spec.match_policy.clone().unwrap_or_default()
    }

    fn match_conditions(&self) -> Option<&[MatchCondition]> {
        self.spec.match_conditions.as_deref()
    }

    fn object_selector(&self) -> Option<&LabelSelector> {
        self.spec.object_selector.as_ref()
    }

    fn side_effects(&self) -> SideEffects {
        self.spec.side_effects.clone().unwrap_or_default()
    }

    fn timeout_seconds(&self) -> i32 {
        self.spec.timeout_seconds.unwrap_or(10)
    }

    fn is_mutating(&self) -> bool {
        self.spec.mutating
    }

    fn module(&self) -> Option<&str> {
        Some(&self.spec.module)
    }

    fn settings(&self) -> Option<&RawExtension> {
        Some(&self.spec.settings)
    }

    fn context_aware_resources(&self) -> BTreeSet<ContextAwareResource> {
        self.spec.context_aware_resources.clone()
    }

    fn namespace_selector(&self) -> Option<&LabelSelector> {
        self.spec.namespace_selector.as_ref()
    }

    fn allow_inside_kubewarden_namespace(&self) -> bool {
        self.spec.allow_inside_kubewarden_namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML_NO_DEFAULTS: &str = r#"
apiVersion: policies.kubewarden.io/v1
kind: ClusterAdmissionPolicy
metadata:
  name: psp-capabilities
spec:
  policyServer: reserved-instance-for-tenant-a
  module: registry://ghcr.io/kubewarden/policies/psp-capabilities:v0.1.9
  rules:
    - apiGroups: [""]
      apiVersions: ["v1"]
      resources: ["pods"]
      operations:
        - CREATE
        - UPDATE
  mutating: true
  settings:
    allowed_capabilities:
      - CHOWN
"#;

    const YAML_WITH_DEFAULTS: &str = r#"
apiVersion: policies.kubewarden.io/v1
kind: ClusterAdmissionPolicy
metadata:
  name: default-values
spec:
  module: registry://ghcr.io/kubewarden/policies/foo:v1.0.0
  rules:
    - apiGroups: [""]
      apiVersions: ["v1"]
      resources: ["pods"]
      operations:
        - CREATE
"#;

    #[test]
    fn deserializes_with_explicit_values() {
        let policy: ClusterAdmissionPolicy = serde_yaml::from_str(YAML_NO_DEFAULTS)
            .expect("cannot deserialize ClusterAdmissionPolicy");

        assert_eq!(
            policy.spec.policy_server,
            "reserved-instance-for-tenant-a".to_string()
        );
        assert!(policy.spec.mutating);
        assert_eq!(
            policy.spec.settings.0,
            serde_json::json!({"allowed_capabilities": ["CHOWN"]})
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let policy: ClusterAdmissionPolicy = serde_yaml::from_str(YAML_WITH_DEFAULTS)
            .expect("cannot deserialize ClusterAdmissionPolicy");

        assert_eq!(policy.spec.policy_server, "default".to_string());
        assert_eq!(policy.spec.settings.0, serde_json::json!({}));
        assert!(!policy.spec.mutating);
        assert!(!policy.spec.allow_inside_kubewarden_namespace);
        assert_eq!(policy.timeout_seconds(), 10);
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: ClusterAdmissionPolicy
metadata:
  name: bogus
spec:
  module: registry://ghcr.io/kubewarden/policies/foo:v1.0.0
  policies: {}
"#;
        let err = serde_yaml::from_str::<ClusterAdmissionPolicy>(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown field `policies`"));
    }
}
