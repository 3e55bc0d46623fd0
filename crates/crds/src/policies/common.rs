/// Types shared by the four policy custom resources.
use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;

#[derive(
    Clone, Default, Debug, serde::Deserialize, serde::Serialize, PartialEq, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum PolicyMode {
    #[default]
    Protect,
    Monitor,
}

/// The mode mirrored back from the policy-server configuration. `Unknown` is
/// reported until the policy shows up in the configmap.
#[derive(
    Clone, Default, Debug, serde::Deserialize, serde::Serialize, PartialEq, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum PolicyModeStatus {
    Protect,
    Monitor,
    #[default]
    Unknown,
}

impl From<PolicyMode> for PolicyModeStatus {
    fn from(mode: PolicyMode) -> Self {
        match mode {
            PolicyMode::Protect => PolicyModeStatus::Protect,
            PolicyMode::Monitor => PolicyModeStatus::Monitor,
        }
    }
}

#[derive(
    Clone, Default, Debug, serde::Deserialize, serde::Serialize, PartialEq, schemars::JsonSchema,
)]
pub enum FailurePolicy {
    #[default]
    /// "Fail" means that an error calling the webhook causes the admission to
    /// fail and the API request to be rejected.
    Fail,
    /// "Ignore" means that an error calling the webhook is ignored and the API
    /// request is allowed to continue.
    Ignore,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Fail => "Fail",
            FailurePolicy::Ignore => "Ignore",
        }
    }
}

#[derive(
    Clone, Default, Debug, serde::Deserialize, serde::Serialize, PartialEq, schemars::JsonSchema,
)]
pub enum MatchPolicy {
    #[default]
    /// Equivalent: match a request if it modifies a resource listed in rules,
    /// even via another API group or version.
    Equivalent,
    /// Exact: match a request only if it exactly matches a specified rule.
    Exact,
}

impl MatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPolicy::Equivalent => "Equivalent",
            MatchPolicy::Exact => "Exact",
        }
    }
}

#[derive(
    Clone, Default, Debug, serde::Deserialize, serde::Serialize, PartialEq, schemars::JsonSchema,
)]
pub enum SideEffects {
    #[default]
    None,
    NoneOnDryRun,
}

impl SideEffects {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffects::None => "None",
            SideEffects::NoneOnDryRun => "NoneOnDryRun",
        }
    }
}

/// A cluster resource a policy is allowed to read at evaluation time. The
/// policy-server grants the policy list/watch access to the matching
/// resources.
#[derive(
    Clone,
    Debug,
    serde::Deserialize,
    serde::Serialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ContextAwareResource {
    pub api_version: String,
    pub kind: String,
}

/// A member of a policy group, referenced by name from the group expression.
#[derive(
    Clone, Default, Debug, serde::Deserialize, serde::Serialize, PartialEq, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyGroupMember {
    /// Module is the location of the WASM module to be loaded. Can be a
    /// local file (file://), a remote file served by an HTTP server
    /// (http://, https://), or an artifact served by an OCI-compatible
    /// registry (registry://).
    pub module: String,

    /// Settings is a free-form object that contains the policy configuration
    /// values.
    #[serde(default = "default_settings")]
    pub settings: RawExtension,
}

/// Group member variant available to cluster-wide groups, which may also
/// declare context-aware resources.
#[derive(
    Clone, Default, Debug, serde::Deserialize, serde::Serialize, PartialEq, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyGroupMemberWithContext {
    /// Module is the location of the WASM module to be loaded. Can be a
    /// local file (file://), a remote file served by an HTTP server
    /// (http://, https://), or an artifact served by an OCI-compatible
    /// registry (registry://).
    pub module: String,

    /// Settings is a free-form object that contains the policy configuration
    /// values.
    #[serde(default = "default_settings")]
    pub settings: RawExtension,

    /// ContextAwareResources lists the cluster resources this member is
    /// allowed to read at evaluation time.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub context_aware_resources: BTreeSet<ContextAwareResource>,
}

impl From<PolicyGroupMember> for PolicyGroupMemberWithContext {
    fn from(member: PolicyGroupMember) -> Self {
        PolicyGroupMemberWithContext {
            module: member.module,
            settings: member.settings,
            context_aware_resources: BTreeSet::new(),
        }
    }
}

/// Where the policy sits in its lifecycle. Transitions only move forward,
/// except that losing a precondition sends the policy back to the state whose
/// precondition still holds.
#[derive(
    Clone,
    Copy,
    Default,
    Debug,
    serde::Deserialize,
    serde::Serialize,
    PartialEq,
    Eq,
    schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum PolicyStatusPhase {
    /// The policy does not name a policy server.
    #[default]
    Unscheduled,
    /// The policy names a policy server that does not exist yet.
    Scheduled,
    /// The policy server exists but has not uniquely loaded this policy.
    Pending,
    /// Every live replica of the policy server serves this policy.
    Active,
}

impl std::fmt::Display for PolicyStatusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            PolicyStatusPhase::Unscheduled => "unscheduled",
            PolicyStatusPhase::Scheduled => "scheduled",
            PolicyStatusPhase::Pending => "pending",
            PolicyStatusPhase::Active => "active",
        };
        write!(f, "{phase}")
    }
}

#[derive(
    Clone, Default, Debug, serde::Deserialize, serde::Serialize, PartialEq, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    /// PolicyStatus represents the observed status of the policy.
    #[serde(default)]
    pub policy_status: PolicyStatusPhase,

    /// PolicyModeStatus mirrors the mode the policy-server configuration
    /// currently carries for this policy.
    #[serde(default)]
    pub policy_mode_status: PolicyModeStatus,

    /// Conditions represent the observed conditions of the policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

pub(crate) fn default_policy_server() -> String {
    "default".to_string()
}

pub(crate) fn default_settings() -> RawExtension {
    RawExtension(serde_json::json!({}))
}

pub(crate) fn empty_group_members() -> BTreeMap<String, PolicyGroupMember> {
    BTreeMap::new()
}

pub(crate) fn empty_group_members_with_context(
) -> BTreeMap<String, PolicyGroupMemberWithContext> {
    BTreeMap::new()
}
