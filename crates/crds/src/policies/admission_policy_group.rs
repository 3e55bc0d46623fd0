use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;

use crate::policies::common::{
    default_policy_server, empty_group_members, FailurePolicy, MatchPolicy, PolicyGroupMember,
    PolicyGroupMemberWithContext, PolicyMode, PolicyStatus, SideEffects,
};
use crate::policies::{Policy, PolicyScope};

/// A namespaced policy whose verdict is a boolean expression over named
/// member policies. It only evaluates requests that target its own
/// namespace; its members cannot read other cluster resources.
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
    kind = "AdmissionPolicyGroup",
    plural = "admissionpolicygroups",
    shortname = "apg",
    namespaced,
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct AdmissionPolicyGroupSpec {
    /// Expression is the evaluation expression to accept or reject the
    /// admission request under evaluation. This field uses CEL as the
    /// expression language. Each policy in the group is represented as a
    /// function call in the expression with the same name as the policy
    /// defined in the group. The expression must evaluate to a boolean.
    pub expression: String,

    /// FailurePolicy defines how unrecognized errors and timeout errors from
    /// the policy are handled.
    pub failure_policy: Option<FailurePolicy>,

    /// MatchConditions are a list of conditions that must be met for a
    /// request to be validated.
    pub match_conditions: Option<Vec<MatchCondition>>,

    /// matchPolicy defines how the "rules" list is used to match incoming
    /// requests.
    pub match_policy: Option<MatchPolicy>,

    /// Message is returned when the policy group rejects a request. The
    /// individual policy results are returned in the warning field of the
    /// response.
    pub message: String,

    /// Mode defines the execution mode of this policy. Can be set to either
    /// "protect" or "monitor". If it's empty, it is defaulted to "protect".
    pub mode: Option<PolicyMode>,

    /// ObjectSelector decides whether to run the webhook based on if the
    /// object has matching labels.
    pub object_selector: Option<LabelSelector>,

    /// Policies is the set of policies that are part of the group, each
    /// available as a function call in the evaluation expression.
    #[serde(default = "empty_group_members")]
    pub policies: BTreeMap<String, PolicyGroupMember>,

    /// identifies an existing PolicyServer resource
    #[serde(default = "default_policy_server")]
    pub policy_server: String,

    /// Rules describes what operations on what resources/subresources the
    /// webhook cares about. The scope of every rule is forced to Namespaced.
    pub rules: Option<Vec<RuleWithOperations>>,

    /// SideEffects states whether this webhook has side effects.
    /// Acceptable values are: None, NoneOnDryRun.
    pub side_effects: Option<SideEffects>,

    /// TimeoutSeconds specifies the timeout for this webhook. The timeout
    /// value must be between 1 and 30 seconds. Default to 10 seconds.
    pub timeout_seconds: Option<i32>,
}

impl Policy for AdmissionPolicyGroup {
    fn policy_server(&self) -> &str {
        &self.spec.policy_server
    }

    fn unique_name(&self) -> String {
        format!(
            "namespaced-group-{}-{}",
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

    fn group_members(&self) -> Option<BTreeMap<String, PolicyGroupMemberWithContext>> {
        Some(
            self.spec
                .policies
                .iter()
                .map(|(name, member)| (name.clone(), member.clone().into()))
                .collect(),
        )
    }

    fn expression(&self) -> Option<&str> {
        Some(&self.spec.expression)
    }

    fn message(&self) -> Option<&str> {
        Some(&self.spec.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_context_aware_resources_are_rejected() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: AdmissionPolicyGroup
metadata:
  name: signatures
  namespace: default
spec:
  policies:
    signed_by_alice:
      module: ghcr.io/kubewarden/policies/verify-image-signatures:v0.3.0
      contextAwareResources:
        - apiVersion: "v1"
          kind: "Namespace"
  expression: "signed_by_alice()"
  message: "not signed"
"#;
        let err = serde_yaml::from_str::<AdmissionPolicyGroup>(yaml).unwrap_err();
        assert!(err
            .to_string()
            .contains("unknown field `contextAwareResources`"));
    }

    #[test]
    fn members_are_widened_with_empty_context() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: AdmissionPolicyGroup
metadata:
  name: signatures
  namespace: default
spec:
  policies:
    signed_by_alice:
      module: ghcr.io/kubewarden/policies/verify-image-signatures:v0.3.0
  expression: "signed_by_alice()"
  message: "not signed"
"#;
        let group: AdmissionPolicyGroup = serde_yaml::from_str(yaml).unwrap();
        let members = group.group_members().unwrap();
        assert!(members["signed_by_alice"]
            .context_aware_resources
            .is_empty());
    }
}
