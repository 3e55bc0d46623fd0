pub mod certs;
pub mod cli;
pub mod conditions;
pub mod config;
pub mod config_document;
pub mod constants;
pub mod controllers;
pub mod errors;
pub mod index;
pub mod leader;
pub mod resources;
pub mod rollout;
pub mod webhooks;

use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use kube::api::{Api, ListParams};
use kube::Client;
use kubewarden_crds::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    Policy, PolicyScope, PolicyServer,
};
use tracing::{debug, error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use config::Config;
use controllers::{certificate_controller, policy_controller, policy_server_controller, Context};
use leader::LeaderElector;

pub async fn run(config: Config) -> Result<()> {
    setup_tracing(&config.log_level, &config.log_fmt, config.log_no_color)?;
    debug!("tracing system ready");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow!("cannot create a Kubernetes client: {e}"))?;

    // The CRD scheme must be installed before anything can be reconciled.
    let policy_servers = Api::<PolicyServer>::all(client.clone());
    if let Err(e) = policy_servers.list(&ListParams::default().limit(1)).await {
        fatal_error(format!(
            "PolicyServer CRD is not queryable, is the Kubewarden CRD scheme installed? {e}"
        ));
    }

    // A single lease gates the whole manager: the certificate reconciler
    // must be a singleton, and running everything on the leader keeps
    // writer races off the shared root CA secret.
    let identity = format!("{}-{}", config::SERVICE_NAME, *config::HOSTNAME);
    let elector = LeaderElector::new(client.clone(), &config.deployment_namespace, identity);
    if let Err(e) = elector.acquire().await {
        fatal_error(format!("leader election failed: {e}"));
    }

    let config = Arc::new(config);
    let ctx = Context::new(client.clone(), config.clone());

    // The first certificate pass bootstraps the root CA; without trust
    // material nothing else can make progress.
    if let Err(e) = certificate_controller::tick(&ctx).await {
        fatal_error(format!("cannot initialize trust material: {e}"));
    }
    info!("trust material ready");

    // The rotation loop never returns on its own; it dies with the process.
    tokio::spawn(certificate_controller::run(ctx.clone()));

    let controllers = async {
        tokio::join!(
            policy_server_controller::run(ctx.clone()),
            policy_controller::run::<ClusterAdmissionPolicy>(
                ctx.clone(),
                Arc::new(|client, _| Api::all(client.clone())),
                PolicyScope::Cluster,
                false,
            ),
            policy_controller::run::<ClusterAdmissionPolicyGroup>(
                ctx.clone(),
                Arc::new(|client, _| Api::all(client.clone())),
                PolicyScope::Cluster,
                true,
            ),
            policy_controller::run::<AdmissionPolicy>(
                ctx.clone(),
                Arc::new(|client, policy: &AdmissionPolicy| {
                    let namespace = Policy::namespace(policy).unwrap_or_default();
                    Api::namespaced(client.clone(), &namespace)
                }),
                PolicyScope::Namespace,
                false,
            ),
            policy_controller::run::<AdmissionPolicyGroup>(
                ctx.clone(),
                Arc::new(|client, policy: &AdmissionPolicyGroup| {
                    let namespace = Policy::namespace(policy).unwrap_or_default();
                    Api::namespaced(client.clone(), &namespace)
                }),
                PolicyScope::Namespace,
                true,
            ),
        )
    };

    tokio::select! {
        _ = controllers => {
            info!("controllers drained, shutting down");
        }
        result = elector.keep_renewing() => {
            if let Err(e) = result {
                fatal_error(format!("{e}"));
            }
        }
    }

    Ok(())
}

fn setup_tracing(log_level: &str, log_fmt: &str, log_no_color: bool) -> Result<()> {
    // some of our dependencies generate trace events too, but we don't care
    // about them -> let's filter them
    let filter_layer = EnvFilter::new(log_level)
        .add_directive("h2=off".parse().unwrap())
        .add_directive("hyper=off".parse().unwrap())
        .add_directive("tower=off".parse().unwrap());

    match log_fmt {
        "json" => tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer().json())
            .init(),
        "text" => {
            let layer = fmt::layer().with_ansi(!log_no_color);

            tracing_subscriber::registry()
                .with(filter_layer)
                .with(layer)
                .init()
        }
        _ => return Err(anyhow!("Unknown log message format")),
    };

    Ok(())
}

pub fn fatal_error(msg: String) -> ! {
    error!("{}", msg);
    process::exit(1);
}
