/// The four Kubewarden policy custom resources and the contract they share.
pub mod admission_policy;
pub mod admission_policy_group;
pub mod cluster_admission_policy;
pub mod cluster_admission_policy_group;
pub mod common;

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;

use self::common::{
    ContextAwareResource, FailurePolicy, MatchPolicy, PolicyGroupMemberWithContext, PolicyMode,
    PolicyStatus, SideEffects,
};

/// Whether a policy targets the whole cluster or a single namespace. The
/// scope is part of the policy identity: it selects the unique-name prefix
/// and the webhook namespace selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyScope {
    Cluster,
    Namespace,
}

impl PolicyScope {
    pub fn as_label_value(&self) -> &'static str {
        match self {
            PolicyScope::Cluster => "cluster",
            PolicyScope::Namespace => "namespace",
        }
    }
}

/// The contract shared by the four policy variants. The reconcile algorithm
/// is variant-agnostic except at configuration serialization and
/// webhook-kind selection, so everything it needs is exposed here.
pub trait Policy {
    /// Name of the PolicyServer this policy is bound to. Empty means the
    /// policy is unscheduled.
    fn policy_server(&self) -> &str;

    /// The deterministic identifier used across the policy-server
    /// configuration, the webhook configuration and the serving URL path.
    fn unique_name(&self) -> String;

    fn scope(&self) -> PolicyScope;

    fn name(&self) -> String;

    fn namespace(&self) -> Option<String>;

    fn mode(&self) -> PolicyMode;

    fn status(&self) -> Option<&PolicyStatus>;

    fn rules(&self) -> &[RuleWithOperations];

    fn failure_policy(&self) -> FailurePolicy;

    fn match_policy(&self) -> MatchPolicy;

    fn match_conditions(&self) -> Option<&[MatchCondition]>;

    fn object_selector(&self) -> Option<&LabelSelector>;

    fn side_effects(&self) -> SideEffects;

    fn timeout_seconds(&self) -> i32;

    /// Whether the policy is allowed to mutate the object under review.
    /// Policy groups can never mutate.
    fn is_mutating(&self) -> bool {
        false
    }

    /// The WASM module URL. `None` for policy groups, which carry one module
    /// per member instead.
    fn module(&self) -> Option<&str> {
        None
    }

    /// The opaque settings document. `None` for policy groups.
    fn settings(&self) -> Option<&RawExtension> {
        None
    }

    /// The members of a policy group, `None` for single policies. Members of
    /// namespaced groups are widened to the context-aware shape with an
    /// empty resource set.
    fn group_members(&self) -> Option<BTreeMap<String, PolicyGroupMemberWithContext>> {
        None
    }

    /// The CEL expression combining the group members, `None` for single
    /// policies.
    fn expression(&self) -> Option<&str> {
        None
    }

    /// The rejection message of a policy group, `None` for single policies.
    fn message(&self) -> Option<&str> {
        None
    }

    fn context_aware_resources(&self) -> BTreeSet<ContextAwareResource> {
        BTreeSet::new()
    }

    /// The namespace selector declared by the user. Only cluster-scoped
    /// policies carry one; namespaced policies are pinned to their own
    /// namespace when the webhook configuration is built.
    fn namespace_selector(&self) -> Option<&LabelSelector> {
        None
    }

    /// Whether the policy may also evaluate requests targeting the namespace
    /// the Kubewarden stack is deployed in.
    fn allow_inside_kubewarden_namespace(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::admission_policy::AdmissionPolicy;
    use super::admission_policy_group::AdmissionPolicyGroup;
    use super::cluster_admission_policy::ClusterAdmissionPolicy;
    use super::cluster_admission_policy_group::ClusterAdmissionPolicyGroup;
    use super::*;

    fn named(
        name: &str,
        namespace: Option<&str>,
    ) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(|ns| ns.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn unique_names_carry_scope_and_variant_prefixes() {
        let cluster = ClusterAdmissionPolicy {
            metadata: named("psp-capabilities", None),
            spec: Default::default(),
            status: None,
        };
        assert_eq!(cluster.unique_name(), "clusterwide-psp-capabilities");

        let namespaced = AdmissionPolicy {
            metadata: named("psp-capabilities", Some("tenant-a")),
            spec: Default::default(),
            status: None,
        };
        assert_eq!(
            namespaced.unique_name(),
            "namespaced-tenant-a-psp-capabilities"
        );

        let cluster_group = ClusterAdmissionPolicyGroup {
            metadata: named("signatures", None),
            spec: Default::default(),
            status: None,
        };
        assert_eq!(cluster_group.unique_name(), "clusterwide-group-signatures");

        let namespaced_group = AdmissionPolicyGroup {
            metadata: named("signatures", Some("tenant-a")),
            spec: Default::default(),
            status: None,
        };
        assert_eq!(
            namespaced_group.unique_name(),
            "namespaced-group-tenant-a-signatures"
        );
    }

    #[test]
    fn groups_are_never_mutating() {
        let group = ClusterAdmissionPolicyGroup {
            metadata: named("signatures", None),
            spec: Default::default(),
            status: None,
        };
        assert!(!group.is_mutating());
        assert!(group.module().is_none());
    }
}
