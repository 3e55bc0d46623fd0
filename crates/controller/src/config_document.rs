//! The configuration documents handed to the policy-server pods: the
//! `policies.yml` map and the `sources.yml` registry settings. Both are
//! stored as JSON inside the per-server configmap, which the policy server
//! treats as its sole source of truth.

use std::collections::{BTreeMap, BTreeSet};

use kubewarden_crds::{ContextAwareResource, Policy, PolicyMode, PolicyServerSpec};

/// The `{namespace, name}` pair identifying the source custom resource of a
/// configuration entry.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedName {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

/// An entry backed by a single WASM module.
///
/// The serialization is asymmetric by variant: a single-policy entry never
/// carries `policies`/`expression`/`message`, and the policy-server parser
/// rejects entries that mix the two shapes. `deny_unknown_fields` on both
/// variants keeps the untagged deserializer honest.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SinglePolicyEntry {
    pub namespaced_name: NamespacedName,
    pub module: String,
    pub policy_mode: PolicyMode,
    pub allowed_to_mutate: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub context_aware_resources: BTreeSet<ContextAwareResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Map<String, serde_json::Value>>,
}

/// An entry describing a policy group: one module per member plus the CEL
/// expression combining their verdicts.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupPolicyEntry {
    pub namespaced_name: NamespacedName,
    pub policy_mode: PolicyMode,
    pub policies: BTreeMap<String, GroupMemberEntry>,
    pub expression: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupMemberEntry {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub context_aware_resources: BTreeSet<ContextAwareResource>,
}

/// A discriminated union over the two entry shapes. Group entries are tried
/// first; thanks to `deny_unknown_fields` an entry carrying both `module`
/// and `policies` matches neither variant and fails to deserialize.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum PolicyEntry {
    Group(GroupPolicyEntry),
    Single(SinglePolicyEntry),
}

/// The full `policies.yml` document: unique name → entry.
pub type PoliciesDocument = BTreeMap<String, PolicyEntry>;

/// Builds the configuration entry for one policy, keyed by its unique name.
pub fn policy_entry<P: Policy>(policy: &P) -> (String, PolicyEntry) {
    let namespaced_name = NamespacedName {
        namespace: policy.namespace().unwrap_or_default(),
        name: policy.name(),
    };

    let entry = match policy.group_members() {
        Some(members) => PolicyEntry::Group(GroupPolicyEntry {
            namespaced_name,
            policy_mode: policy.mode(),
            policies: members
                .into_iter()
                .map(|(name, member)| {
                    (
                        name,
                        GroupMemberEntry {
                            module: member.module,
                            settings: settings_map(&member.settings.0),
                            context_aware_resources: member.context_aware_resources,
                        },
                    )
                })
                .collect(),
            expression: policy.expression().unwrap_or_default().to_string(),
            message: policy.message().unwrap_or_default().to_string(),
        }),
        None => PolicyEntry::Single(SinglePolicyEntry {
            namespaced_name,
            module: policy.module().unwrap_or_default().to_string(),
            policy_mode: policy.mode(),
            allowed_to_mutate: policy.is_mutating(),
            context_aware_resources: policy.context_aware_resources(),
            settings: policy.settings().and_then(|raw| settings_map(&raw.0)),
        }),
    };

    (policy.unique_name(), entry)
}

fn settings_map(value: &serde_json::Value) -> Option<serde_json::Map<String, serde_json::Value>> {
    match value.as_object() {
        Some(map) if !map.is_empty() => Some(map.clone()),
        _ => None,
    }
}

/// The `sources.yml` document. Both top-level values default to empty
/// collections and are never serialized as null: the policy-server parser
/// chokes on explicit nulls.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SourcesDocument {
    #[serde(default)]
    pub insecure_sources: Vec<String>,
    #[serde(default)]
    pub source_authorities: BTreeMap<String, Vec<SourceAuthority>>,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "type")]
pub enum SourceAuthority {
    Data { data: String },
}

pub fn sources_document(spec: &PolicyServerSpec) -> SourcesDocument {
    SourcesDocument {
        insecure_sources: spec.insecure_sources.clone().unwrap_or_default(),
        source_authorities: spec
            .source_authorities
            .as_ref()
            .map(|authorities| {
                authorities
                    .iter()
                    .map(|(uri, certs)| {
                        (
                            uri.clone(),
                            certs
                                .iter()
                                .map(|pem| SourceAuthority::Data { data: pem.clone() })
                                .collect(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubewarden_crds::{
        AdmissionPolicyGroup, AdmissionPolicyGroupSpec, ClusterAdmissionPolicy,
        ClusterAdmissionPolicySpec, PolicyGroupMember,
    };
    use rstest::rstest;

    fn cluster_policy(mutating: bool) -> ClusterAdmissionPolicy {
        ClusterAdmissionPolicy {
            metadata: ObjectMeta {
                name: Some("psp-capabilities".to_string()),
                ..Default::default()
            },
            spec: ClusterAdmissionPolicySpec {
                module: "registry://ghcr.io/kubewarden/policies/psp-capabilities:v0.1.9"
                    .to_string(),
                mutating,
                settings: k8s_openapi::apimachinery::pkg::runtime::RawExtension(
                    serde_json::json!({"allowed_capabilities": ["CHOWN"]}),
                ),
                ..Default::default()
            },
            status: None,
        }
    }

    fn group_policy() -> AdmissionPolicyGroup {
        let mut members = BTreeMap::new();
        members.insert(
            "signed_by_alice".to_string(),
            PolicyGroupMember {
                module: "ghcr.io/kubewarden/policies/verify-image-signatures:v0.3.0".to_string(),
                ..Default::default()
            },
        );
        AdmissionPolicyGroup {
            metadata: ObjectMeta {
                name: Some("signatures".to_string()),
                namespace: Some("tenant-a".to_string()),
                ..Default::default()
            },
            spec: AdmissionPolicyGroupSpec {
                policies: members,
                expression: "signed_by_alice()".to_string(),
                message: "not signed".to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn single_entry_shape(#[case] mutating: bool) {
        let (unique_name, entry) = policy_entry(&cluster_policy(mutating));
        assert_eq!(unique_name, "clusterwide-psp-capabilities");

        let serialized = serde_json::to_value(&entry).unwrap();
        assert_eq!(serialized["allowedToMutate"], serde_json::json!(mutating));
        assert_eq!(
            serialized["settings"],
            serde_json::json!({"allowed_capabilities": ["CHOWN"]})
        );
        // single entries never leak group fields
        assert!(serialized.get("policies").is_none());
        assert!(serialized.get("expression").is_none());
        assert!(serialized.get("message").is_none());
    }

    #[test]
    fn group_entry_shape() {
        let (unique_name, entry) = policy_entry(&group_policy());
        assert_eq!(unique_name, "namespaced-group-tenant-a-signatures");

        let serialized = serde_json::to_value(&entry).unwrap();
        assert_eq!(serialized["expression"], "signed_by_alice()");
        assert_eq!(
            serialized["policies"]["signed_by_alice"]["module"],
            "ghcr.io/kubewarden/policies/verify-image-signatures:v0.3.0"
        );
        // group entries never leak single-policy fields
        assert!(serialized.get("module").is_none());
        assert!(serialized.get("allowedToMutate").is_none());
        // empty member settings are omitted, not serialized as null
        assert!(serialized["policies"]["signed_by_alice"]
            .get("settings")
            .is_none());
    }

    #[test]
    fn document_round_trips() {
        let mut document = PoliciesDocument::new();
        let (name, entry) = policy_entry(&cluster_policy(false));
        document.insert(name, entry);
        let (name, entry) = policy_entry(&group_policy());
        document.insert(name, entry);

        let json = serde_json::to_string(&document).unwrap();
        let parsed: PoliciesDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, document);

        assert!(matches!(
            parsed["clusterwide-psp-capabilities"],
            PolicyEntry::Single(_)
        ));
        assert!(matches!(
            parsed["namespaced-group-tenant-a-signatures"],
            PolicyEntry::Group(_)
        ));
    }

    #[test]
    fn entry_with_both_module_and_policies_is_rejected() {
        let json = r#"{
            "namespacedName": {"name": "broken"},
            "module": "registry://m:1",
            "policyMode": "protect",
            "allowedToMutate": false,
            "policies": {},
            "expression": "true",
            "message": "nope"
        }"#;
        assert!(serde_json::from_str::<PolicyEntry>(json).is_err());
    }

    #[test]
    fn sources_default_to_empty_collections() {
        let sources = sources_document(&PolicyServerSpec::default());
        let json = serde_json::to_string(&sources).unwrap();
        assert_eq!(
            json,
            r#"{"insecure_sources":[],"source_authorities":{}}"#
        );
    }

    #[test]
    fn sources_carry_data_authorities() {
        let spec = PolicyServerSpec {
            insecure_sources: Some(vec!["registry.local:5000".to_string()]),
            source_authorities: Some(
                [(
                    "registry.example.com".to_string(),
                    vec!["-----BEGIN CERTIFICATE-----\nZm9v\n-----END CERTIFICATE-----"
                        .to_string()],
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        };

        let sources = sources_document(&spec);
        let value = serde_json::to_value(&sources).unwrap();
        assert_eq!(
            value["source_authorities"]["registry.example.com"][0]["type"],
            "Data"
        );
        assert_eq!(
            value["insecure_sources"],
            serde_json::json!(["registry.local:5000"])
        );
    }
}
