//! The cooperating reconcilers. Ordering among them is established only
//! through observed object state, never through in-process signalling: each
//! controller owns its watches and work-queue, and the only shared pieces
//! are the client, the configuration and the per-variant reverse indexes.

pub mod certificate_controller;
pub mod policy_controller;
pub mod policy_server_controller;

use std::sync::Arc;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::constants::{KUBEWARDEN_FINALIZER, LEGACY_FINALIZER};
use crate::errors::{Error, Result};

/// State shared by every reconciler.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<Config>,
    pub reporter: Reporter,
}

impl Context {
    pub fn new(client: Client, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Context {
            client,
            config,
            reporter: "kubewarden-controller".into(),
        })
    }

    pub fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }
}

/// Errors requeue with backoff; conflicts are not failures, the next
/// observation carries the latest state, so they retry quickly.
pub fn error_policy<K>(_object: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "reconcile failed");
    if error.is_conflict() {
        Action::requeue(Duration::from_secs(1))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}

/// Adds the domain-qualified finalizer if it is not present yet. The
/// defaulting webhook normally installs it at admission time; doing it here
/// too keeps deletion safe when that webhook is mis-deployed.
pub async fn ensure_finalizer<K>(api: &Api<K>, object: &K) -> Result<()>
where
    K: Resource<DynamicType = ()>
        + Clone
        + serde::Serialize
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    if object
        .finalizers()
        .iter()
        .any(|finalizer| finalizer == KUBEWARDEN_FINALIZER)
    {
        return Ok(());
    }

    let mut finalizers = object.finalizers().to_vec();
    finalizers.push(KUBEWARDEN_FINALIZER.to_string());
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &object.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Strips both the domain-qualified finalizer and the legacy pre-migration
/// one, letting the API server finish the deletion.
pub async fn remove_finalizers<K>(api: &Api<K>, object: &K) -> Result<()>
where
    K: Resource<DynamicType = ()>
        + Clone
        + serde::Serialize
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    let finalizers: Vec<_> = object
        .finalizers()
        .iter()
        .filter(|finalizer| {
            finalizer.as_str() != KUBEWARDEN_FINALIZER && finalizer.as_str() != LEGACY_FINALIZER
        })
        .cloned()
        .collect();

    if finalizers.len() == object.finalizers().len() {
        return Ok(());
    }

    let patch = json!({"metadata": {"finalizers": finalizers}});
    match api
        .patch(
            &object.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => Ok(()),
        // the object may vanish the moment the last finalizer is gone
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
