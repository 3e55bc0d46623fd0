//! The policy reconciler: one generic state machine
//! (`unscheduled → scheduled → pending → active`) instantiated for the four
//! policy variants. The algorithm is variant-agnostic; the variants differ
//! only in configuration serialization and webhook-kind selection, both of
//! which live behind the `Policy` trait.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use kubewarden_crds::{
    Policy, PolicyModeStatus, PolicyScope, PolicyServer, PolicyStatus, PolicyStatusPhase,
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::certs::ca_bundle_from_secret;
use crate::conditions::{false_condition, set_condition, true_condition, unknown_condition};
use crate::constants::{
    CONDITION_POLICY_ACTIVE, CONDITION_POLICY_SERVER_CONFIGURATION_UP_TO_DATE,
    CONDITION_POLICY_UNIQUELY_REACHABLE, POLICY_GROUP_ANNOTATION, POLICY_NAMESPACE_ANNOTATION,
    POLICY_NAME_ANNOTATION, POLICY_SCOPE_LABEL_KEY, POLICY_SERVER_LABEL_KEY,
    REASON_CONFIGURATION_VERSION_MATCH, REASON_CONFIGURATION_VERSION_MISMATCH,
    REASON_NOT_UNIQUELY_REACHABLE, REASON_POLICY_ACTIVE, REASON_POLICY_SERVER_NOT_REACHED,
    REASON_UNIQUELY_REACHABLE, REASON_UNKNOWN_CONFIGURATION_VERSION,
};
use crate::controllers::{ensure_finalizer, remove_finalizers, Context};
use crate::errors::{Error, Result};
use crate::index::PolicyIndex;
use crate::rollout::{
    deployment_config_version, parse_policies_data, policy_uniquely_reachable,
};
use crate::webhooks::{
    delete_webhook_configuration, managed_selector, reconcile_webhook_configuration,
};

/// Requeue interval while waiting for the rollout barrier.
const PENDING_REQUEUE: Duration = Duration::from_secs(5);

/// Everything the generic reconciler demands from a policy variant.
pub trait PolicyResource:
    Policy
    + Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> PolicyResource for T where
    T: Policy
        + Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Builds the Api matching the variant's scope; cluster-wide variants
/// ignore the object, namespaced ones read its namespace.
pub type ApiFactory<P> = Arc<dyn Fn(&Client, &P) -> Api<P> + Send + Sync>;

pub struct PolicyContext<P>
where
    P: PolicyResource,
{
    pub context: Arc<Context>,
    pub index: Arc<PolicyIndex<P>>,
    pub api_factory: ApiFactory<P>,
}

pub async fn run<P>(ctx: Arc<Context>, api_factory: ApiFactory<P>, scope: PolicyScope, group: bool)
where
    P: PolicyResource,
{
    let client = ctx.client.clone();
    let namespace = ctx.config.deployment_namespace.clone();
    let index = Arc::new(PolicyIndex::<P>::default());
    let policy_ctx = Arc::new(PolicyContext {
        context: ctx,
        index: index.clone(),
        api_factory,
    });

    // children of policy servers carry the reverse-index label
    let children = watcher::Config::default().labels(POLICY_SERVER_LABEL_KEY);
    let webhooks = watcher::Config::default().labels(&managed_selector());

    let server_index = index.clone();
    let configmap_index = index.clone();
    let deployment_index = index.clone();
    let replica_set_index = index.clone();
    let pod_index = index.clone();

    Controller::new(Api::<P>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<PolicyServer>::all(client.clone()),
            watcher::Config::default(),
            move |server| server_index.policies_for(&server.name_any()),
        )
        .watches(
            Api::<ConfigMap>::namespaced(client.clone(), &namespace),
            children.clone(),
            move |configmap| indexed_policies(&configmap_index, configmap.meta()),
        )
        .watches(
            Api::<Deployment>::namespaced(client.clone(), &namespace),
            children.clone(),
            move |deployment| indexed_policies(&deployment_index, deployment.meta()),
        )
        .watches(
            Api::<ReplicaSet>::namespaced(client.clone(), &namespace),
            children.clone(),
            move |replica_set| indexed_policies(&replica_set_index, replica_set.meta()),
        )
        .watches(
            Api::<Pod>::namespaced(client.clone(), &namespace),
            children,
            move |pod| indexed_policies(&pod_index, pod.meta()),
        )
        .watches(
            Api::<ValidatingWebhookConfiguration>::all(client.clone()),
            webhooks.clone(),
            move |configuration| policy_ref_from_webhook(configuration.meta(), scope, group),
        )
        .watches(
            Api::<MutatingWebhookConfiguration>::all(client.clone()),
            webhooks,
            move |configuration| policy_ref_from_webhook(configuration.meta(), scope, group),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, policy_ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(policy = %object, "reconciled"),
                Err(e) => warn!(error = %e, "policy reconcile error"),
            }
        })
        .await;
}

/// Fan a child event out to every policy bound to the child's policy
/// server, via the reverse index.
fn indexed_policies<P>(index: &PolicyIndex<P>, meta: &ObjectMeta) -> Vec<ObjectRef<P>>
where
    P: PolicyResource,
{
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(POLICY_SERVER_LABEL_KEY))
        .map(|server| index.policies_for(server))
        .unwrap_or_default()
}

/// Maps a managed webhook configuration back to its source policy, using
/// the annotations stamped at creation time. Scope label and group marker
/// pick the variant, so each controller only wakes for its own kind.
fn policy_ref_from_webhook<P>(
    meta: &ObjectMeta,
    scope: PolicyScope,
    group: bool,
) -> Option<ObjectRef<P>>
where
    P: PolicyResource,
{
    let labels = meta.labels.as_ref()?;
    if labels.get(POLICY_SCOPE_LABEL_KEY)? != scope.as_label_value() {
        return None;
    }

    let annotations = meta.annotations.as_ref()?;
    let is_group_config = annotations
        .get(POLICY_GROUP_ANNOTATION)
        .is_some_and(|marker| marker == "true");
    if is_group_config != group {
        return None;
    }

    let name = annotations.get(POLICY_NAME_ANNOTATION)?;
    let reference = ObjectRef::new(name);
    match scope {
        PolicyScope::Cluster => Some(reference),
        PolicyScope::Namespace => {
            let namespace = annotations.get(POLICY_NAMESPACE_ANNOTATION)?;
            Some(reference.within(namespace))
        }
    }
}

fn error_policy<P>(_policy: Arc<P>, error: &Error, _ctx: Arc<PolicyContext<P>>) -> Action
where
    P: PolicyResource,
{
    warn!(error = %error, "policy reconcile failed");
    if error.is_conflict() {
        Action::requeue(Duration::from_secs(1))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}

pub async fn reconcile<P>(policy: Arc<P>, ctx: Arc<PolicyContext<P>>) -> Result<Action>
where
    P: PolicyResource,
{
    let client = &ctx.context.client;
    let api = (ctx.api_factory)(client, policy.as_ref());

    // Deletion path: tear the webhook down, then let go of the object.
    if policy.meta().deletion_timestamp.is_some() {
        delete_webhook_configuration(client, policy.as_ref()).await?;
        ctx.index.unbind(&ObjectRef::from_obj(policy.as_ref()));
        remove_finalizers(&api, policy.as_ref()).await?;
        return Ok(Action::await_change());
    }

    ensure_finalizer(&api, policy.as_ref()).await?;

    let previous_phase = policy
        .status()
        .map(|status| status.policy_status)
        .unwrap_or_default();
    let mut status = policy.status().cloned().unwrap_or_default();

    let action = reconcile_live_policy(&policy, &ctx, &mut status).await?;

    write_status(&api, policy.as_ref(), &status).await?;
    publish_transition(&ctx.context, policy.as_ref(), previous_phase, status.policy_status).await;

    Ok(action)
}

async fn reconcile_live_policy<P>(
    policy: &Arc<P>,
    ctx: &PolicyContext<P>,
    status: &mut PolicyStatus,
) -> Result<Action>
where
    P: PolicyResource,
{
    let client = &ctx.context.client;
    let namespace = &ctx.context.config.deployment_namespace;
    let unique_name = policy.unique_name();

    // Classification: no policy server named means unscheduled.
    let policy_server_name = policy.policy_server().to_string();
    if policy_server_name.is_empty() {
        ctx.index.unbind(&ObjectRef::from_obj(policy.as_ref()));
        status.policy_status = PolicyStatusPhase::Unscheduled;
        status.policy_mode_status = PolicyModeStatus::Unknown;
        set_condition(
            &mut status.conditions,
            false_condition(
                CONDITION_POLICY_ACTIVE,
                REASON_POLICY_SERVER_NOT_REACHED,
                "policy is not scheduled on any policy server",
            ),
        );
        return Ok(Action::await_change());
    }

    // Record the binding before the first read: the PolicyServer watch uses
    // the index to wake this policy up once the server appears.
    ctx.index
        .bind(&policy_server_name, ObjectRef::from_obj(policy.as_ref()));

    let policy_servers: Api<PolicyServer> = Api::all(client.clone());
    let Some(policy_server) = policy_servers.get_opt(&policy_server_name).await? else {
        status.policy_status = PolicyStatusPhase::Scheduled;
        set_condition(
            &mut status.conditions,
            false_condition(
                CONDITION_POLICY_ACTIVE,
                REASON_POLICY_SERVER_NOT_REACHED,
                &format!("policy server {policy_server_name} does not exist"),
            ),
        );
        return Ok(Action::await_change());
    };

    // Rollout materials. Absent children mean the workload reconciler has
    // not caught up: pending, requeue, never an error.
    let prefix = policy_server.name_with_prefix();
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);

    let Some(deployment) = deployments.get_opt(&prefix).await? else {
        return Ok(mark_pending(status, "policy server deployment not found"));
    };
    let Some(configmap) = configmaps.get_opt(&prefix).await? else {
        return Ok(mark_pending(status, "policy server configmap not found"));
    };

    let selector = format!("{POLICY_SERVER_LABEL_KEY}={policy_server_name}");
    let replica_sets = Api::<ReplicaSet>::namespaced(client.clone(), namespace)
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;
    let pods = Api::<Pod>::namespaced(client.clone(), namespace)
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;

    // The uniqueness barrier: no webhook may point at a replica set that
    // has not loaded this policy yet.
    if !policy_uniquely_reachable(&configmap, &deployment, &replica_sets, &pods, &unique_name) {
        return Ok(mark_pending(
            status,
            "not every policy server replica serves the latest configuration",
        ));
    }
    set_condition(
        &mut status.conditions,
        true_condition(
            CONDITION_POLICY_UNIQUELY_REACHABLE,
            REASON_UNIQUELY_REACHABLE,
            "every policy server replica serves the latest configuration",
        ),
    );

    // Trust material: the CA bundle handed to the API server is the current
    // root certificate, plus the previous one during a rotation overlap.
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let Some(root_secret) = secrets
        .get_opt(&ctx.context.config.root_ca_secret_name)
        .await?
    else {
        return Ok(mark_pending(status, "root CA secret not found yet"));
    };
    let ca_bundle = ca_bundle_from_secret(&root_secret)?;

    reconcile_webhook_configuration(client, policy.as_ref(), &prefix, namespace, &ca_bundle)
        .await?;

    set_condition(
        &mut status.conditions,
        true_condition(CONDITION_POLICY_ACTIVE, REASON_POLICY_ACTIVE, ""),
    );
    status.policy_status = PolicyStatusPhase::Active;

    // Configuration-version condition: compare the deployment's stamped
    // config-version with the configmap's current revision.
    let version_condition = match deployment_config_version(&deployment) {
        None => unknown_condition(
            CONDITION_POLICY_SERVER_CONFIGURATION_UP_TO_DATE,
            REASON_UNKNOWN_CONFIGURATION_VERSION,
            "deployment carries no config-version annotation",
        ),
        Some(version) if Some(version) == configmap.metadata.resource_version.as_deref() => {
            true_condition(
                CONDITION_POLICY_SERVER_CONFIGURATION_UP_TO_DATE,
                REASON_CONFIGURATION_VERSION_MATCH,
                "",
            )
        }
        Some(_) => false_condition(
            CONDITION_POLICY_SERVER_CONFIGURATION_UP_TO_DATE,
            REASON_CONFIGURATION_VERSION_MISMATCH,
            "deployment has not rolled to the latest configuration",
        ),
    };
    set_condition(&mut status.conditions, version_condition);

    // Mode condition: mirror whatever mode the configuration document
    // currently carries for this policy.
    status.policy_mode_status = configured_policy_mode(&configmap, &unique_name);

    Ok(Action::requeue(Duration::from_secs(3600)))
}

fn mark_pending(status: &mut PolicyStatus, message: &str) -> Action {
    status.policy_status = PolicyStatusPhase::Pending;
    set_condition(
        &mut status.conditions,
        false_condition(
            CONDITION_POLICY_UNIQUELY_REACHABLE,
            REASON_NOT_UNIQUELY_REACHABLE,
            message,
        ),
    );
    Action::requeue(PENDING_REQUEUE)
}

fn configured_policy_mode(configmap: &ConfigMap, unique_name: &str) -> PolicyModeStatus {
    let Some(policies) = parse_policies_data(configmap) else {
        return PolicyModeStatus::Unknown;
    };
    match policies
        .get(unique_name)
        .and_then(|entry| entry.get("policyMode"))
        .and_then(|mode| mode.as_str())
    {
        Some("protect") => PolicyModeStatus::Protect,
        Some("monitor") => PolicyModeStatus::Monitor,
        _ => PolicyModeStatus::Unknown,
    }
}

async fn write_status<P>(api: &Api<P>, policy: &P, status: &PolicyStatus) -> Result<()>
where
    P: PolicyResource,
{
    api.patch_status(
        &policy.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({ "status": status })),
    )
    .await?;
    Ok(())
}

async fn publish_transition<P>(
    ctx: &Context,
    policy: &P,
    previous: PolicyStatusPhase,
    current: PolicyStatusPhase,
) where
    P: PolicyResource,
{
    if previous == current {
        return;
    }

    let event = Event {
        type_: EventType::Normal,
        reason: "PolicyStatusChanged".to_string(),
        note: Some(format!("policy status moved from {previous} to {current}")),
        action: "Reconciling".to_string(),
        secondary: None,
    };
    if let Err(e) = ctx
        .recorder()
        .publish(&event, &policy.object_ref(&()))
        .await
    {
        debug!(error = %e, "cannot publish policy transition event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubewarden_crds::ClusterAdmissionPolicy;
    use std::collections::BTreeMap;

    fn webhook_meta(
        scope: &str,
        group: bool,
        name: &str,
        namespace: &str,
    ) -> ObjectMeta {
        let mut annotations = BTreeMap::new();
        annotations.insert(POLICY_NAME_ANNOTATION.to_string(), name.to_string());
        annotations.insert(
            POLICY_NAMESPACE_ANNOTATION.to_string(),
            namespace.to_string(),
        );
        if group {
            annotations.insert(POLICY_GROUP_ANNOTATION.to_string(), "true".to_string());
        }

        ObjectMeta {
            labels: Some(BTreeMap::from([(
                POLICY_SCOPE_LABEL_KEY.to_string(),
                scope.to_string(),
            )])),
            annotations: Some(annotations),
            ..Default::default()
        }
    }

    #[test]
    fn webhook_mapper_resolves_cluster_policies() {
        let reference = policy_ref_from_webhook::<ClusterAdmissionPolicy>(
            &webhook_meta("cluster", false, "psp-capabilities", ""),
            PolicyScope::Cluster,
            false,
        )
        .unwrap();
        assert_eq!(reference.name, "psp-capabilities");
    }

    #[test]
    fn webhook_mapper_ignores_other_variants() {
        // a group configuration never wakes the single-policy controller
        assert!(policy_ref_from_webhook::<ClusterAdmissionPolicy>(
            &webhook_meta("cluster", true, "signatures", ""),
            PolicyScope::Cluster,
            false,
        )
        .is_none());

        // a namespace-scoped configuration never wakes the cluster controller
        assert!(policy_ref_from_webhook::<ClusterAdmissionPolicy>(
            &webhook_meta("namespace", false, "psp-capabilities", "tenant-a"),
            PolicyScope::Cluster,
            false,
        )
        .is_none());
    }

    #[test]
    fn mode_is_mirrored_from_the_configuration_document() {
        let configmap = ConfigMap {
            data: Some(BTreeMap::from([(
                crate::constants::POLICIES_CONFIG_KEY.to_string(),
                r#"{"clusterwide-p1": {"namespacedName": {"name": "p1"}, "module": "registry://m:1", "policyMode": "monitor", "allowedToMutate": false}}"#
                    .to_string(),
            )])),
            ..Default::default()
        };

        assert_eq!(
            configured_policy_mode(&configmap, "clusterwide-p1"),
            PolicyModeStatus::Monitor
        );
        assert_eq!(
            configured_policy_mode(&configmap, "clusterwide-absent"),
            PolicyModeStatus::Unknown
        );
    }

    #[test]
    fn pending_policies_report_the_reachability_gap() {
        let mut status = PolicyStatus::default();
        mark_pending(&mut status, "rollout in progress");

        assert_eq!(status.policy_status, PolicyStatusPhase::Pending);
        let condition = crate::conditions::find_condition(
            &status.conditions,
            CONDITION_POLICY_UNIQUELY_REACHABLE,
        )
        .unwrap();
        assert_eq!(condition.status, "False");
        assert_eq!(condition.reason, REASON_NOT_UNIQUELY_REACHABLE);
    }
}
