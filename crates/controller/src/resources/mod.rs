//! Desired-state builders for the children owned by a PolicyServer, plus the
//! server-side-apply helper every reconciler writes through.

pub mod configmap;
pub mod deployment;
pub mod pdb;
pub mod secret;
pub mod service;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Resource;
use kubewarden_crds::PolicyServer;

use crate::constants::{
    COMPONENT_LABEL_KEY, COMPONENT_LABEL_VALUE, FIELD_MANAGER, PART_OF_LABEL_KEY,
    PART_OF_LABEL_VALUE, POLICY_SERVER_LABEL_KEY,
};
use crate::errors::{Error, Result};

const CONFLICT_RETRIES: usize = 5;

/// CreateOrPatch: a forced server-side apply. Conflicting managers lose,
/// which is what repairs drift on every reconcile.
pub async fn apply<K>(api: &Api<K>, name: &str, object: &K) -> Result<K>
where
    K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let params = PatchParams::apply(FIELD_MANAGER).force();
    Ok(api.patch(name, &params, &Patch::Apply(object)).await?)
}

/// Get-mutate-replace with retry on optimistic-concurrency clashes. Used
/// where several reconcilers race over the same object and a forced apply
/// would trample another manager's fields.
pub async fn retry_on_conflict<K, F>(api: &Api<K>, name: &str, mutate: F) -> Result<()>
where
    K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
    F: Fn(&mut K),
{
    for _ in 0..CONFLICT_RETRIES {
        let mut object = api.get(name).await?;
        mutate(&mut object);
        match api.replace(name, &PostParams::default(), &object).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::Kube(kube::Error::Api(Box::new(kube::core::Status {
        status: Some(kube::core::response::StatusSummary::Failure),
        message: format!("too many conflicts updating {name}"),
        reason: "Conflict".to_string(),
        code: 409,
        metadata: None,
        details: None,
    }))))
}

/// The labels shared by every child object of a policy server. The
/// `kubewarden/policy-server` label is the reverse-index key the policy
/// reconciler uses to map children back to policies.
pub fn child_labels(policy_server: &PolicyServer) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            PART_OF_LABEL_KEY.to_string(),
            PART_OF_LABEL_VALUE.to_string(),
        ),
        (
            COMPONENT_LABEL_KEY.to_string(),
            COMPONENT_LABEL_VALUE.to_string(),
        ),
        (
            POLICY_SERVER_LABEL_KEY.to_string(),
            policy_server.metadata.name.clone().unwrap_or_default(),
        ),
    ])
}

/// The label selector used to enumerate the pods (and replica sets) of one
/// policy server.
pub fn pod_selector(policy_server: &PolicyServer) -> BTreeMap<String, String> {
    BTreeMap::from([(
        POLICY_SERVER_LABEL_KEY.to_string(),
        policy_server.metadata.name.clone().unwrap_or_default(),
    )])
}

pub fn owner_reference(policy_server: &PolicyServer) -> Vec<OwnerReference> {
    policy_server
        .controller_owner_ref(&())
        .map(|reference| vec![reference])
        .unwrap_or_default()
}
