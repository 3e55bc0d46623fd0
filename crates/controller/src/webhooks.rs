//! Materializes each policy as a validating or mutating webhook
//! configuration, and keeps the cluster state canonical: on every reconcile
//! the whole object is recomputed and written back, deliberately overwriting
//! external edits.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use kubewarden_crds::validation::force_namespaced_scope;
use kubewarden_crds::{Policy, PolicyScope};
use tracing::{debug, info};

use crate::constants::{
    FIELD_MANAGER, PART_OF_LABEL_KEY, PART_OF_LABEL_VALUE, POLICY_GROUP_ANNOTATION,
    POLICY_NAMESPACE_ANNOTATION, POLICY_NAME_ANNOTATION, POLICY_SCOPE_LABEL_KEY,
    POLICY_SERVER_PORT, WEBHOOK_NAME_SUFFIX,
};
use crate::errors::Result;
use crate::resources::retry_on_conflict;

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";
const ADMISSION_REVIEW_VERSIONS: &[&str] = &["v1"];

/// The label selector identifying every webhook configuration managed by
/// this controller.
pub fn managed_selector() -> String {
    format!("{PART_OF_LABEL_KEY}={PART_OF_LABEL_VALUE}")
}

fn webhook_metadata<P: Policy>(policy: &P) -> ObjectMeta {
    let mut labels = BTreeMap::new();
    labels.insert(
        PART_OF_LABEL_KEY.to_string(),
        PART_OF_LABEL_VALUE.to_string(),
    );
    labels.insert(
        POLICY_SCOPE_LABEL_KEY.to_string(),
        policy.scope().as_label_value().to_string(),
    );

    let mut annotations = BTreeMap::new();
    annotations.insert(POLICY_NAME_ANNOTATION.to_string(), policy.name());
    annotations.insert(
        POLICY_NAMESPACE_ANNOTATION.to_string(),
        policy.namespace().unwrap_or_default(),
    );
    if policy.group_members().is_some() {
        annotations.insert(POLICY_GROUP_ANNOTATION.to_string(), "true".to_string());
    }

    ObjectMeta {
        name: Some(policy.unique_name()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}

fn client_config(
    policy_server_service: &str,
    deployment_namespace: &str,
    path: String,
    ca_bundle: &[u8],
) -> WebhookClientConfig {
    WebhookClientConfig {
        service: Some(ServiceReference {
            name: policy_server_service.to_string(),
            namespace: deployment_namespace.to_string(),
            path: Some(path),
            port: Some(POLICY_SERVER_PORT),
        }),
        ca_bundle: Some(ByteString(ca_bundle.to_vec())),
        url: None,
    }
}

/// Computes the namespace selector of the inner webhook:
/// - namespaced policies are pinned to their own namespace;
/// - cluster policies keep the user's selector, extended to exclude the
///   Kubewarden namespace unless the policy explicitly opted in.
fn namespace_selector<P: Policy>(policy: &P, deployment_namespace: &str) -> Option<LabelSelector> {
    match policy.scope() {
        PolicyScope::Namespace => Some(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: NAMESPACE_NAME_LABEL.to_string(),
                operator: "In".to_string(),
                values: Some(vec![policy.namespace().unwrap_or_default()]),
            }]),
            match_labels: None,
        }),
        PolicyScope::Cluster => {
            if policy.allow_inside_kubewarden_namespace() {
                return policy.namespace_selector().cloned();
            }

            let mut selector = policy.namespace_selector().cloned().unwrap_or_default();
            selector
                .match_expressions
                .get_or_insert_with(Vec::new)
                .push(LabelSelectorRequirement {
                    key: NAMESPACE_NAME_LABEL.to_string(),
                    operator: "NotIn".to_string(),
                    values: Some(vec![deployment_namespace.to_string()]),
                });
            Some(selector)
        }
    }
}

fn webhook_rules<P: Policy>(policy: &P) -> Option<Vec<RuleWithOperations>> {
    let mut rules = policy.rules().to_vec();
    if policy.scope() == PolicyScope::Namespace {
        force_namespaced_scope(&mut rules);
    }
    (!rules.is_empty()).then_some(rules)
}

pub fn validating_webhook_configuration<P: Policy>(
    policy: &P,
    policy_server_service: &str,
    deployment_namespace: &str,
    ca_bundle: &[u8],
) -> ValidatingWebhookConfiguration {
    let unique_name = policy.unique_name();
    ValidatingWebhookConfiguration {
        metadata: webhook_metadata(policy),
        webhooks: Some(vec![ValidatingWebhook {
            name: format!("{unique_name}{WEBHOOK_NAME_SUFFIX}"),
            admission_review_versions: ADMISSION_REVIEW_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            client_config: client_config(
                policy_server_service,
                deployment_namespace,
                format!("/validate/{unique_name}"),
                ca_bundle,
            ),
            rules: webhook_rules(policy),
            failure_policy: Some(policy.failure_policy().as_str().to_string()),
            match_policy: Some(policy.match_policy().as_str().to_string()),
            match_conditions: policy.match_conditions().map(<[_]>::to_vec),
            namespace_selector: namespace_selector(policy, deployment_namespace),
            object_selector: policy.object_selector().cloned(),
            side_effects: policy.side_effects().as_str().to_string(),
            timeout_seconds: Some(policy.timeout_seconds()),
        }]),
    }
}

pub fn mutating_webhook_configuration<P: Policy>(
    policy: &P,
    policy_server_service: &str,
    deployment_namespace: &str,
    ca_bundle: &[u8],
) -> MutatingWebhookConfiguration {
    let unique_name = policy.unique_name();
    MutatingWebhookConfiguration {
        metadata: webhook_metadata(policy),
        webhooks: Some(vec![MutatingWebhook {
            name: format!("{unique_name}{WEBHOOK_NAME_SUFFIX}"),
            admission_review_versions: ADMISSION_REVIEW_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            client_config: client_config(
                policy_server_service,
                deployment_namespace,
                format!("/mutate/{unique_name}"),
                ca_bundle,
            ),
            rules: webhook_rules(policy),
            failure_policy: Some(policy.failure_policy().as_str().to_string()),
            match_policy: Some(policy.match_policy().as_str().to_string()),
            match_conditions: policy.match_conditions().map(<[_]>::to_vec),
            namespace_selector: namespace_selector(policy, deployment_namespace),
            object_selector: policy.object_selector().cloned(),
            side_effects: policy.side_effects().as_str().to_string(),
            timeout_seconds: Some(policy.timeout_seconds()),
            reinvocation_policy: None,
        }]),
    }
}

/// Writes the webhook configuration matching the policy kind, repairing any
/// drift from the canonical shape.
pub async fn reconcile_webhook_configuration<P: Policy>(
    client: &Client,
    policy: &P,
    policy_server_service: &str,
    deployment_namespace: &str,
    ca_bundle: &[u8],
) -> Result<()> {
    let patch_params = PatchParams::apply(FIELD_MANAGER).force();

    if policy.is_mutating() {
        let desired = mutating_webhook_configuration(
            policy,
            policy_server_service,
            deployment_namespace,
            ca_bundle,
        );
        let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
        api.patch(&policy.unique_name(), &patch_params, &Patch::Apply(&desired))
            .await?;
    } else {
        let desired = validating_webhook_configuration(
            policy,
            policy_server_service,
            deployment_namespace,
            ca_bundle,
        );
        let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
        api.patch(&policy.unique_name(), &patch_params, &Patch::Apply(&desired))
            .await?;
    }

    Ok(())
}

/// Deletes the webhook configuration matching the policy kind. Tolerates an
/// already-deleted configuration: policy deletion must complete even when
/// the policy server (or the webhook) is long gone.
pub async fn delete_webhook_configuration<P: Policy>(client: &Client, policy: &P) -> Result<()> {
    let name = policy.unique_name();
    let outcome = if policy.is_mutating() {
        let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
        api.delete(&name, &Default::default()).await.map(|_| ())
    } else {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
        api.delete(&name, &Default::default()).await.map(|_| ())
    };

    match outcome {
        Ok(()) => {
            info!(webhook = name.as_str(), "webhook configuration deleted");
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Injects the given CA bundle into every managed webhook configuration.
/// Used by the rotation loop, which races with the policy reconcilers over
/// these objects: updates go through plain replace with retry-on-conflict.
pub async fn inject_ca_bundle(client: &Client, ca_bundle: &[u8]) -> Result<()> {
    let list_params = ListParams::default().labels(&managed_selector());

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    for configuration in validating.list(&list_params).await? {
        let name = configuration.metadata.name.clone().unwrap_or_default();
        retry_on_conflict(&validating, &name, |config| {
            for webhook in config.webhooks.get_or_insert_with(Vec::new) {
                webhook.client_config.ca_bundle = Some(ByteString(ca_bundle.to_vec()));
            }
        })
        .await?;
        debug!(webhook = name.as_str(), "CA bundle injected");
    }

    let mutating: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    for configuration in mutating.list(&list_params).await? {
        let name = configuration.metadata.name.clone().unwrap_or_default();
        retry_on_conflict(&mutating, &name, |config| {
            for webhook in config.webhooks.get_or_insert_with(Vec::new) {
                webhook.client_config.ca_bundle = Some(ByteString(ca_bundle.to_vec()));
            }
        })
        .await?;
        debug!(webhook = name.as_str(), "CA bundle injected");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubewarden_crds::{
        AdmissionPolicy, AdmissionPolicySpec, ClusterAdmissionPolicy, ClusterAdmissionPolicySpec,
        ClusterAdmissionPolicyGroup, ClusterAdmissionPolicyGroupSpec,
    };

    const CA_BUNDLE: &[u8] = b"-----BEGIN CERTIFICATE-----\ntest\n-----END CERTIFICATE-----\n";

    fn cluster_policy(
        mutating: bool,
        allow_inside_kubewarden_namespace: bool,
    ) -> ClusterAdmissionPolicy {
        ClusterAdmissionPolicy {
            metadata: ObjectMeta {
                name: Some("psp-capabilities".to_string()),
                ..Default::default()
            },
            spec: ClusterAdmissionPolicySpec {
                module: "registry://m:1".to_string(),
                mutating,
                allow_inside_kubewarden_namespace,
                rules: Some(vec![RuleWithOperations {
                    api_groups: Some(vec!["".to_string()]),
                    api_versions: Some(vec!["v1".to_string()]),
                    resources: Some(vec!["pods".to_string()]),
                    operations: Some(vec!["CREATE".to_string()]),
                    scope: None,
                }]),
                ..Default::default()
            },
            status: None,
        }
    }

    fn namespaced_policy() -> AdmissionPolicy {
        AdmissionPolicy {
            metadata: ObjectMeta {
                name: Some("psp-capabilities".to_string()),
                namespace: Some("tenant-a".to_string()),
                ..Default::default()
            },
            spec: AdmissionPolicySpec {
                module: "registry://m:1".to_string(),
                rules: Some(vec![RuleWithOperations {
                    api_groups: Some(vec!["".to_string()]),
                    api_versions: Some(vec!["v1".to_string()]),
                    resources: Some(vec!["pods".to_string()]),
                    operations: Some(vec!["CREATE".to_string()]),
                    scope: Some("*".to_string()),
                }]),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn validating_configuration_shape() {
        let policy = cluster_policy(false, false);
        let config =
            validating_webhook_configuration(&policy, "policy-server-default", "kubewarden", CA_BUNDLE);

        assert_eq!(
            config.metadata.name.as_deref(),
            Some("clusterwide-psp-capabilities")
        );
        let labels = config.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[PART_OF_LABEL_KEY], PART_OF_LABEL_VALUE);
        assert_eq!(labels[POLICY_SCOPE_LABEL_KEY], "cluster");

        let webhooks = config.webhooks.as_ref().unwrap();
        assert_eq!(webhooks.len(), 1);
        let webhook = &webhooks[0];
        assert_eq!(
            webhook.name,
            "clusterwide-psp-capabilities.kubewarden.admission"
        );
        assert_eq!(webhook.admission_review_versions, vec!["v1"]);
        assert_eq!(webhook.side_effects, "None");

        let service = webhook.client_config.service.as_ref().unwrap();
        assert_eq!(service.name, "policy-server-default");
        assert_eq!(service.namespace, "kubewarden");
        assert_eq!(
            service.path.as_deref(),
            Some("/validate/clusterwide-psp-capabilities")
        );
        assert_eq!(service.port, Some(POLICY_SERVER_PORT));
        assert_eq!(
            webhook.client_config.ca_bundle.as_ref().unwrap().0,
            CA_BUNDLE
        );
    }

    #[test]
    fn mutating_configuration_uses_mutate_path() {
        let policy = cluster_policy(true, false);
        let config =
            mutating_webhook_configuration(&policy, "policy-server-default", "kubewarden", CA_BUNDLE);

        let webhook = &config.webhooks.as_ref().unwrap()[0];
        assert_eq!(
            webhook.client_config.service.as_ref().unwrap().path.as_deref(),
            Some("/mutate/clusterwide-psp-capabilities")
        );
    }

    #[test]
    fn cluster_policy_excludes_kubewarden_namespace_by_default() {
        let policy = cluster_policy(false, false);
        let config =
            validating_webhook_configuration(&policy, "policy-server-default", "kubewarden", CA_BUNDLE);

        let selector = config.webhooks.as_ref().unwrap()[0]
            .namespace_selector
            .as_ref()
            .unwrap();
        let expressions = selector.match_expressions.as_ref().unwrap();
        assert!(expressions.iter().any(|requirement| {
            requirement.key == NAMESPACE_NAME_LABEL
                && requirement.operator == "NotIn"
                && requirement.values == Some(vec!["kubewarden".to_string()])
        }));
    }

    #[test]
    fn cluster_policy_opting_in_keeps_user_selector_untouched() {
        let mut policy = cluster_policy(false, true);
        policy.spec.namespace_selector = Some(LabelSelector {
            match_labels: Some(
                [("environment".to_string(), "prod".to_string())]
                    .into_iter()
                    .collect(),
            ),
            match_expressions: None,
        });

        let config =
            validating_webhook_configuration(&policy, "policy-server-default", "kubewarden", CA_BUNDLE);
        let selector = config.webhooks.as_ref().unwrap()[0]
            .namespace_selector
            .as_ref()
            .unwrap();
        assert!(selector.match_expressions.is_none());
        assert_eq!(
            selector.match_labels.as_ref().unwrap()["environment"],
            "prod"
        );
    }

    #[test]
    fn namespaced_policy_is_pinned_to_its_namespace() {
        let policy = namespaced_policy();
        let config =
            validating_webhook_configuration(&policy, "policy-server-default", "kubewarden", CA_BUNDLE);

        let webhook = &config.webhooks.as_ref().unwrap()[0];
        let expressions = webhook
            .namespace_selector
            .as_ref()
            .unwrap()
            .match_expressions
            .as_ref()
            .unwrap();
        assert_eq!(expressions.len(), 1);
        assert_eq!(expressions[0].operator, "In");
        assert_eq!(expressions[0].values, Some(vec!["tenant-a".to_string()]));

        // rule scope is forced to Namespaced, whatever the user wrote
        let rules = webhook.rules.as_ref().unwrap();
        assert_eq!(rules[0].scope.as_deref(), Some("Namespaced"));
    }

    #[test]
    fn group_policies_are_marked_in_annotations() {
        let group = ClusterAdmissionPolicyGroup {
            metadata: ObjectMeta {
                name: Some("signatures".to_string()),
                ..Default::default()
            },
            spec: ClusterAdmissionPolicyGroupSpec {
                expression: "true".to_string(),
                message: "nope".to_string(),
                ..Default::default()
            },
            status: None,
        };

        let config =
            validating_webhook_configuration(&group, "policy-server-default", "kubewarden", CA_BUNDLE);
        let annotations = config.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[POLICY_GROUP_ANNOTATION], "true");
        assert_eq!(annotations[POLICY_NAME_ANNOTATION], "signatures");
    }

    #[test]
    fn recomputation_is_deterministic() {
        let policy = cluster_policy(false, false);
        let first =
            validating_webhook_configuration(&policy, "policy-server-default", "kubewarden", CA_BUNDLE);
        let second =
            validating_webhook_configuration(&policy, "policy-server-default", "kubewarden", CA_BUNDLE);
        assert_eq!(first, second);
    }
}
