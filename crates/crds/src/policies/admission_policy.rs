use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::CustomResource;

use crate::policies::common::{
    default_policy_server, default_settings, FailurePolicy, MatchPolicy, PolicyMode, PolicyStatus,
    SideEffects,
};
use crate::policies::{Policy, PolicyScope};

/// A namespaced admission policy backed by a single WASM module. It only
/// evaluates requests that target its own namespace, and it cannot read
/// other cluster resources at evaluation time.
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
    kind = "AdmissionPolicy",
    plural = "admissionpolicies",
    shortname = "ap",
    namespaced,
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct AdmissionPolicySpec {
    /// FailurePolicy defines how unrecognized errors and timeout errors from
    /// the policy are handled.
    pub failure_policy: Option<FailurePolicy>,

    /// MatchConditions are a list of conditions that must be met for a
    /// request to be validated. Match conditions filter requests that have
    /// already been matched by the rules and objectSelector.
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

    /// ObjectSelector decides whether to run the webhook based on if the
    /// object has matching labels.
    pub object_selector: Option<LabelSelector>,

    /// identifies an existing PolicyServer resource
    #[serde(default = "default_policy_server")]
    pub policy_server: String,

    /// Rules describes what operations on what resources/subresources the
    /// webhook cares about. The scope of every rule is forced to Namespaced.
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

impl Policy for AdmissionPolicy {
    fn policy_server(&self) -> &str {
        &self.spec.policy_server
    }

    fn unique_name(&self) -> String {
        format!(
            "namespaced-{}-{}",
            self.namespace().unwrap_or_default(),
            self.name()
        )
    }

    fn scope(&self) -> PolicyScope {
        PolicyScope::Namespace
    }

    fn name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    fn namespace(&self) -> Option<String> {
        self.metadata.namespace.clone()
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_and_defaults() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: AdmissionPolicy
metadata:
  name: psp-capabilities
  namespace: default
spec:
  module: registry://ghcr.io/kubewarden/policies/psp-capabilities:v0.1.9
  rules:
    - apiGroups: [""]
      apiVersions: ["v1"]
      resources: ["pods"]
      operations:
        - CREATE
"#;
        let policy: AdmissionPolicy =
            serde_yaml::from_str(yaml).expect("cannot deserialize AdmissionPolicy");

        assert_eq!(policy.spec.policy_server, "default".to_string());
        assert_eq!(policy.spec.settings.0, serde_json::json!({}));
        assert!(!policy.spec.mutating);
    }

    #[test]
    fn namespaced_policies_do_not_accept_context_aware_resources() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: AdmissionPolicy
metadata:
  name: psp-capabilities
  namespace: default
spec:
  module: registry://ghcr.io/kubewarden/policies/psp-capabilities:v0.1.9
  contextAwareResources:
    - apiVersion: "v1"
      kind: "Pod"
"#;
        let err = serde_yaml::from_str::<AdmissionPolicy>(yaml).unwrap_err();
        assert!(err
            .to_string()
            .contains("unknown field `contextAwareResources`"));
    }

    #[test]
    fn namespaced_policies_do_not_accept_namespace_selector() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: AdmissionPolicy
metadata:
  name: psp-capabilities
  namespace: default
spec:
  module: registry://ghcr.io/kubewarden/policies/psp-capabilities:v0.1.9
  namespaceSelector:
    matchExpressions:
      - key: environment
        operator: In
        values: ["prod"]
"#;
        let err = serde_yaml::from_str::<AdmissionPolicy>(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown field `namespaceSelector`"));
    }
}
