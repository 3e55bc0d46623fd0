//! The workload reconciler: for each PolicyServer, maintain the configmap,
//! the server certificate secret, the service, the optional
//! PodDisruptionBudget and the deployment. Deletion is gated on no policies
//! being bound.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use kubewarden_crds::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    Policy, PolicyServer, PolicyServerStatus,
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::certs::ca_from_secret;
use crate::conditions::{false_condition, set_condition, true_condition};
use crate::config_document::{policy_entry, PoliciesDocument};
use crate::constants::{
    CONDITION_CA_ROOT_SECRET_RECONCILED, CONDITION_CERT_SECRET_RECONCILED,
    CONDITION_CONFIGMAP_RECONCILED, CONDITION_DEPLOYMENT_RECONCILED, CONDITION_PDB_RECONCILED,
    CONDITION_SERVICE_RECONCILED, REASON_RECONCILIATION_FAILED, REASON_RECONCILIATION_SUCCEEDED,
};
use crate::controllers::{ensure_finalizer, error_policy, remove_finalizers, Context};
use crate::errors::{Error, Result};
use crate::resources::configmap::desired_configmap;
use crate::resources::deployment::desired_deployment;
use crate::resources::pdb::desired_pdb;
use crate::resources::secret::{cert_secret_is_complete, desired_cert_secret, server_cert_san};
use crate::resources::service::desired_service;
use crate::resources::apply;
use crate::webhooks::managed_selector;

/// Requeue interval while bound policies are being cascaded away.
const DELETION_REQUEUE: Duration = Duration::from_secs(5);
/// Requeue interval while a dependent read comes up empty.
const WAITING_REQUEUE: Duration = Duration::from_secs(10);

enum Outcome {
    Converged,
    Waiting(Duration),
}

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let namespace = ctx.config.deployment_namespace.clone();
    let children = watcher::Config::default().labels(&managed_selector());

    let policy_servers = Api::<PolicyServer>::all(client.clone());
    Controller::new(policy_servers, watcher::Config::default())
        .owns(
            Api::<ConfigMap>::namespaced(client.clone(), &namespace),
            children.clone(),
        )
        .owns(
            Api::<Deployment>::namespaced(client.clone(), &namespace),
            children.clone(),
        )
        .owns(
            Api::<Service>::namespaced(client.clone(), &namespace),
            children.clone(),
        )
        .owns(
            Api::<Secret>::namespaced(client.clone(), &namespace),
            children.clone(),
        )
        .owns(
            Api::<PodDisruptionBudget>::namespaced(client.clone(), &namespace),
            children.clone(),
        )
        .watches(
            Api::<ClusterAdmissionPolicy>::all(client.clone()),
            watcher::Config::default(),
            |policy| bound_server_ref(&policy),
        )
        .watches(
            Api::<AdmissionPolicy>::all(client.clone()),
            watcher::Config::default(),
            |policy| bound_server_ref(&policy),
        )
        .watches(
            Api::<ClusterAdmissionPolicyGroup>::all(client.clone()),
            watcher::Config::default(),
            |policy| bound_server_ref(&policy),
        )
        .watches(
            Api::<AdmissionPolicyGroup>::all(client.clone()),
            watcher::Config::default(),
            |policy| bound_server_ref(&policy),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(policy_server = %object, "reconciled"),
                Err(e) => warn!(error = %e, "policy server reconcile error"),
            }
        })
        .await;
}

fn bound_server_ref<P: Policy>(policy: &P) -> Option<ObjectRef<PolicyServer>> {
    let policy_server = policy.policy_server();
    (!policy_server.is_empty()).then(|| ObjectRef::new(policy_server))
}

pub async fn reconcile(policy_server: Arc<PolicyServer>, ctx: Arc<Context>) -> Result<Action> {
    if policy_server.metadata.deletion_timestamp.is_some() {
        return cleanup(&policy_server, &ctx).await;
    }

    let api: Api<PolicyServer> = Api::all(ctx.client.clone());
    ensure_finalizer(&api, policy_server.as_ref()).await?;

    let mut conditions = policy_server
        .status
        .clone()
        .unwrap_or_default()
        .conditions;
    let result = reconcile_children(&policy_server, &ctx, &mut conditions).await;

    let status = PolicyServerStatus { conditions };
    api.patch_status(
        &policy_server.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({ "status": status })),
    )
    .await?;

    match result? {
        Outcome::Converged => Ok(Action::requeue(Duration::from_secs(3600))),
        Outcome::Waiting(delay) => Ok(Action::requeue(delay)),
    }
}

async fn reconcile_children(
    policy_server: &PolicyServer,
    ctx: &Context,
    conditions: &mut Vec<Condition>,
) -> Result<Outcome> {
    let client = &ctx.client;
    let namespace = &ctx.config.deployment_namespace;
    let name = policy_server.name_with_prefix();

    let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let pdbs: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), namespace);

    // Trust material first: the server certificate is signed by the root CA
    // the certificate reconciler maintains. A missing root secret is a
    // precondition failure, not an error.
    let root_secret = secrets.get_opt(&ctx.config.root_ca_secret_name).await?;
    let Some(root_secret) = root_secret else {
        set_condition(
            conditions,
            false_condition(
                CONDITION_CA_ROOT_SECRET_RECONCILED,
                REASON_RECONCILIATION_FAILED,
                "root CA secret not found yet",
            ),
        );
        return Ok(Outcome::Waiting(WAITING_REQUEUE));
    };
    let ca = record(
        conditions,
        CONDITION_CA_ROOT_SECRET_RECONCILED,
        ca_from_secret(&root_secret),
    )?;

    let configmap_result = async {
        let document = bound_policies_document(client, policy_server).await?;
        let configmap = desired_configmap(policy_server, namespace, &document)?;
        apply(&configmaps, &name, &configmap).await
    }
    .await;
    let applied_configmap = record(conditions, CONDITION_CONFIGMAP_RECONCILED, configmap_result)?;
    let config_version = applied_configmap
        .metadata
        .resource_version
        .clone()
        .unwrap_or_default();

    let cert_result = async {
        match secrets.get_opt(&name).await? {
            Some(existing) if cert_secret_is_complete(&existing) => Ok(()),
            _ => {
                let pair = ca
                    .sign_server_cert(&server_cert_san(policy_server, namespace))
                    .map_err(Error::Certificate)?;
                let secret = desired_cert_secret(policy_server, namespace, &pair);
                apply(&secrets, &name, &secret).await.map(|_| ())
            }
        }
    }
    .await;
    record(conditions, CONDITION_CERT_SECRET_RECONCILED, cert_result)?;

    let service = desired_service(policy_server, namespace, ctx.config.enable_metrics);
    record(
        conditions,
        CONDITION_SERVICE_RECONCILED,
        apply(&services, &name, &service).await,
    )?;

    let pdb_result = async {
        match desired_pdb(policy_server, namespace) {
            Some(pdb) => apply(&pdbs, &name, &pdb).await.map(|_| ()),
            None => match pdbs.delete(&name, &Default::default()).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
    .await;
    record(conditions, CONDITION_PDB_RECONCILED, pdb_result)?;

    let deployment = desired_deployment(policy_server, &ctx.config, &config_version);
    record(
        conditions,
        CONDITION_DEPLOYMENT_RECONCILED,
        apply(&deployments, &name, &deployment).await,
    )?;

    Ok(Outcome::Converged)
}

fn record<T>(conditions: &mut Vec<Condition>, type_: &str, result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => set_condition(
            conditions,
            true_condition(type_, REASON_RECONCILIATION_SUCCEEDED, ""),
        ),
        Err(error) => set_condition(
            conditions,
            false_condition(type_, REASON_RECONCILIATION_FAILED, &error.to_string()),
        ),
    }
    result
}

/// The configuration document listing every policy currently bound to this
/// server, across all four variants. Policies being deleted are excluded:
/// their entries disappear from the configmap ahead of the webhook teardown.
async fn bound_policies_document(
    client: &Client,
    policy_server: &PolicyServer,
) -> Result<PoliciesDocument> {
    let policy_server_name = policy_server.metadata.name.clone().unwrap_or_default();
    let mut document = PoliciesDocument::new();

    for policy in Api::<ClusterAdmissionPolicy>::all(client.clone())
        .list(&ListParams::default())
        .await?
    {
        insert_if_bound(&mut document, &policy, &policy_server_name);
    }
    for policy in Api::<AdmissionPolicy>::all(client.clone())
        .list(&ListParams::default())
        .await?
    {
        insert_if_bound(&mut document, &policy, &policy_server_name);
    }
    for policy in Api::<ClusterAdmissionPolicyGroup>::all(client.clone())
        .list(&ListParams::default())
        .await?
    {
        insert_if_bound(&mut document, &policy, &policy_server_name);
    }
    for policy in Api::<AdmissionPolicyGroup>::all(client.clone())
        .list(&ListParams::default())
        .await?
    {
        insert_if_bound(&mut document, &policy, &policy_server_name);
    }

    Ok(document)
}

fn insert_if_bound<P>(document: &mut PoliciesDocument, policy: &P, policy_server_name: &str)
where
    P: Policy + Resource<DynamicType = ()>,
{
    if policy.policy_server() != policy_server_name {
        return;
    }
    if policy.meta().deletion_timestamp.is_some() {
        return;
    }
    let (unique_name, entry) = policy_entry(policy);
    document.insert(unique_name, entry);
}

/// Deletion path: a PolicyServer with bound policies cascades the deletion
/// to them and waits; once none are left the finalizer drops.
async fn cleanup(policy_server: &PolicyServer, ctx: &Context) -> Result<Action> {
    let remaining = delete_bound_policies(&ctx.client, policy_server).await?;
    if remaining > 0 {
        info!(
            policy_server = policy_server.name_any().as_str(),
            remaining, "waiting for bound policies to be deleted"
        );
        return Ok(Action::requeue(DELETION_REQUEUE));
    }

    let api: Api<PolicyServer> = Api::all(ctx.client.clone());
    remove_finalizers(&api, policy_server).await?;
    Ok(Action::await_change())
}

async fn delete_bound_policies(client: &Client, policy_server: &PolicyServer) -> Result<usize> {
    let policy_server_name = policy_server.metadata.name.clone().unwrap_or_default();
    let mut remaining = 0;

    let cluster_policies: Api<ClusterAdmissionPolicy> = Api::all(client.clone());
    for policy in cluster_policies.list(&ListParams::default()).await? {
        if policy.policy_server() == policy_server_name {
            remaining += 1;
            delete_tolerant(&cluster_policies, &policy.name_any()).await?;
        }
    }

    let cluster_groups: Api<ClusterAdmissionPolicyGroup> = Api::all(client.clone());
    for policy in cluster_groups.list(&ListParams::default()).await? {
        if policy.policy_server() == policy_server_name {
            remaining += 1;
            delete_tolerant(&cluster_groups, &policy.name_any()).await?;
        }
    }

    for policy in Api::<AdmissionPolicy>::all(client.clone())
        .list(&ListParams::default())
        .await?
    {
        if policy.policy_server() == policy_server_name {
            remaining += 1;
            let namespace = Policy::namespace(&policy).unwrap_or_default();
            let api: Api<AdmissionPolicy> = Api::namespaced(client.clone(), &namespace);
            delete_tolerant(&api, &policy.name_any()).await?;
        }
    }

    for policy in Api::<AdmissionPolicyGroup>::all(client.clone())
        .list(&ListParams::default())
        .await?
    {
        if policy.policy_server() == policy_server_name {
            remaining += 1;
            let namespace = Policy::namespace(&policy).unwrap_or_default();
            let api: Api<AdmissionPolicyGroup> = Api::namespaced(client.clone(), &namespace);
            delete_tolerant(&api, &policy.name_any()).await?;
        }
    }

    Ok(remaining)
}

async fn delete_tolerant<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::child_labels;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubewarden_crds::{AdmissionPolicySpec, ClusterAdmissionPolicySpec, PolicyServerSpec};

    fn policy_server(name: &str) -> PolicyServer {
        PolicyServer {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: PolicyServerSpec {
                image: "ghcr.io/kubewarden/policy-server:v1.26.0".to_string(),
                replicas: 1,
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn policies_of_other_servers_are_not_listed() {
        let mut document = PoliciesDocument::new();
        let bound = ClusterAdmissionPolicy {
            metadata: ObjectMeta {
                name: Some("bound".to_string()),
                ..Default::default()
            },
            spec: ClusterAdmissionPolicySpec {
                module: "registry://m:1".to_string(),
                policy_server: "default".to_string(),
                ..Default::default()
            },
            status: None,
        };
        let foreign = ClusterAdmissionPolicy {
            metadata: ObjectMeta {
                name: Some("foreign".to_string()),
                ..Default::default()
            },
            spec: ClusterAdmissionPolicySpec {
                module: "registry://m:1".to_string(),
                policy_server: "other".to_string(),
                ..Default::default()
            },
            status: None,
        };

        insert_if_bound(&mut document, &bound, "default");
        insert_if_bound(&mut document, &foreign, "default");

        assert_eq!(document.len(), 1);
        assert!(document.contains_key("clusterwide-bound"));
    }

    #[test]
    fn deleted_policies_leave_the_document() {
        let mut document = PoliciesDocument::new();
        let deleted = AdmissionPolicy {
            metadata: ObjectMeta {
                name: Some("gone".to_string()),
                namespace: Some("tenant-a".to_string()),
                deletion_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                    k8s_openapi::jiff::Timestamp::now(),
                )),
                ..Default::default()
            },
            spec: AdmissionPolicySpec {
                module: "registry://m:1".to_string(),
                policy_server: "default".to_string(),
                ..Default::default()
            },
            status: None,
        };

        insert_if_bound(&mut document, &deleted, "default");
        assert!(document.is_empty());
    }

    #[test]
    fn unbound_policy_produces_no_server_wakeup() {
        let unscheduled = ClusterAdmissionPolicy {
            metadata: ObjectMeta {
                name: Some("floating".to_string()),
                ..Default::default()
            },
            spec: ClusterAdmissionPolicySpec {
                module: "registry://m:1".to_string(),
                policy_server: String::new(),
                ..Default::default()
            },
            status: None,
        };
        assert!(bound_server_ref(&unscheduled).is_none());

        let bound = ClusterAdmissionPolicy {
            spec: ClusterAdmissionPolicySpec {
                policy_server: "default".to_string(),
                ..unscheduled.spec.clone()
            },
            ..unscheduled
        };
        assert_eq!(bound_server_ref(&bound).unwrap().name, "default");
    }

    #[test]
    fn child_labels_key_the_reverse_index() {
        let labels = child_labels(&policy_server("default"));
        assert_eq!(labels["kubewarden/policy-server"], "default");
        assert_eq!(labels["app.kubernetes.io/part-of"], "kubewarden");
    }
}
