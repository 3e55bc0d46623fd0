use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;

use crate::policies::common::{
    default_policy_server, empty_group_members_with_context, ContextAwareResource, FailurePolicy,
    MatchPolicy, PolicyGroupMemberWithContext, PolicyMode, PolicyStatus, SideEffects,
};
use crate::policies::{Policy, PolicyScope};

/// A cluster-wide policy whose verdict is a boolean expression over named
/// member policies. Policy groups can never mutate the request under review.
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
    kind = "ClusterAdmissionPolicyGroup",
    plural = "clusteradmissionpolicygroups",
    shortname = "capg",
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct ClusterAdmissionPolicyGroupSpec {
    /// AllowInsideKubewardenNamespace lets the policy also evaluate requests
    /// that target the namespace the Kubewarden stack is deployed in.
    #[serde(default)]
    pub allow_inside_kubewarden_namespace: bool,

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

    /// NamespaceSelector decides whether to run the webhook on an object
    /// based on whether the namespace for that object matches the selector.
    pub namespace_selector: Option<LabelSelector>,

    /// ObjectSelector decides whether to run the webhook based on if the
    /// object has matching labels.
    pub object_selector: Option<LabelSelector>,

    /// Policies is the set of policies that are part of the group, each
    /// available as a function call in the evaluation expression.
    #[serde(default = "empty_group_members_with_context")]
    pub policies: BTreeMap<String, PolicyGroupMemberWithContext>,

    /// identifies an existing PolicyServer resource
    #[serde(default = "default_policy_server")]
    pub policy_server: String,

    /// Rules describes what operations on what resources/subresources the
    /// webhook cares about.
    pub rules: Option<Vec<RuleWithOperations>>,

    /// SideEffects states whether this webhook has side effects.
    /// Acceptable values are: None, NoneOnDryRun.
    pub side_effects: Option<SideEffects>,

    /// TimeoutSeconds specifies the timeout for this webhook. The timeout
    /// value must be between 1 and 30 seconds. Default to 10 seconds.
    pub timeout_seconds: Option<i32>,
}

impl Policy for ClusterAdmissionPolicyGroup {
    fn policy_server(&self) -> &str {
        &self.spec.policy_server
    }

    fn unique_name(&self) -> String {
        format!("clusterwide-group-{}", self.name())
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

    fn group_members(&self) -> Option<BTreeMap<String, PolicyGroupMemberWithContext>> {
        Some(self.spec.policies.clone())
    }

    fn expression(&self) -> Option<&str> {
        Some(&self.spec.expression)
    }

    fn message(&self) -> Option<&str> {
        Some(&self.spec.message)
    }

    fn context_aware_resources(&self) -> BTreeSet<ContextAwareResource> {
        self.spec
            .policies
            .values()
            .flat_map(|member| member.context_aware_resources.iter().cloned())
            .collect()
    }

    fn namespace_selector(&self) -> Option<&LabelSelector> {
        self.spec.namespace_selector.as_ref()
    }

    fn allow_inside_kubewarden_namespace(&self) -> bool {
        self.spec.allow_inside_kubewarden_namespace
    }
}
