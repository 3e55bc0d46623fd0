//! The certificate reconciler: a periodic, leader-gated loop that rotates
//! the root CA and every server certificate it signs. The overlap window
//! guarantees that at every instant during a rotation the published CA
//! bundle accepts both the certificates currently deployed and the ones
//! being rotated in.

use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, PostParams};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::certs::{
    ca_bundle_from_secret, ca_from_secret, expires_within, is_expired, root_ca_secret_data,
    server_cert_secret_data, verify_server_cert, CertificateAuthority, ROTATION_LOOKAHEAD,
};
use crate::constants::{
    OLD_CA_ROOT_CERT_KEY, PART_OF_LABEL_KEY, PART_OF_LABEL_VALUE, POLICY_SERVER_LABEL_KEY,
    SERVER_CERT_KEY,
};
use crate::controllers::Context;
use crate::errors::{Error, Result};
use crate::resources::retry_on_conflict;
use crate::webhooks::inject_ca_bundle;

/// How often the rotation loop wakes up.
pub const ROTATION_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Upper bound for a single API call inside the loop; the tick is split
/// into bounded steps rather than one long-running operation.
const API_TIMEOUT: Duration = Duration::from_secs(5);

async fn with_timeout<T, F>(future: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, kube::Error>>,
{
    tokio::time::timeout(API_TIMEOUT, future).await?.map_err(Error::Kube)
}

pub async fn run(ctx: Arc<Context>) {
    let mut ticker = interval(ROTATION_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = tick(&ctx).await {
            error!(error = %e, "certificate reconciliation failed");
        }
    }
}

/// One full pass: root bootstrap, root rotation, old-root cleanup, then
/// server certificate refresh.
pub async fn tick(ctx: &Context) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(
        ctx.client.clone(),
        &ctx.config.deployment_namespace,
    );

    let root_secret = ensure_root_ca_secret(ctx, &secrets).await?;
    let root_secret = rotate_root_ca(ctx, &secrets, root_secret).await?;
    let root_secret = drop_expired_old_ca(ctx, &secrets, root_secret).await?;

    let ca = ca_from_secret(&root_secret)?;
    refresh_server_certs(ctx, &secrets, &ca).await
}

/// Creates the root CA secret if it does not exist at all. An existing but
/// unreadable secret is a loud failure: regenerating it would silently
/// invalidate every certificate in the cluster.
async fn ensure_root_ca_secret(ctx: &Context, secrets: &Api<Secret>) -> Result<Secret> {
    let name = &ctx.config.root_ca_secret_name;
    if let Some(secret) = with_timeout(secrets.get_opt(name)).await? {
        return Ok(secret);
    }

    info!(secret = name.as_str(), "bootstrapping root CA");
    let ca = CertificateAuthority::generate()?;
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ctx.config.deployment_namespace.clone()),
            ..Default::default()
        },
        data: Some(root_ca_secret_data(&ca, None)),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    Ok(with_timeout(secrets.create(&PostParams::default(), &secret)).await?)
}

/// Phase 1: when the root CA approaches its notAfter, generate a fresh one,
/// keep the previous certificate in the secret for the overlap window, and
/// publish the combined bundle to every managed webhook configuration.
async fn rotate_root_ca(ctx: &Context, secrets: &Api<Secret>, root_secret: Secret) -> Result<Secret> {
    let ca = ca_from_secret(&root_secret)?;
    if !expires_within(ca.cert_pem.as_bytes(), ROTATION_LOOKAHEAD)? {
        return Ok(root_secret);
    }

    info!("root CA approaches expiry, rotating");
    let new_ca = CertificateAuthority::generate()?;
    let data = root_ca_secret_data(&new_ca, Some(&ca.cert_pem));

    let name = &ctx.config.root_ca_secret_name;
    retry_on_conflict(secrets, name, |secret| {
        secret.data = Some(data.clone());
    })
    .await?;

    let updated = with_timeout(secrets.get(name)).await?;
    let bundle = ca_bundle_from_secret(&updated)?;
    inject_ca_bundle(&ctx.client, &bundle).await?;
    info!("combined CA bundle published to all managed webhook configurations");

    Ok(updated)
}

/// Phase 2: once the previous root certificate has expired, drop it from
/// the secret and shrink the published bundle back to the current root.
async fn drop_expired_old_ca(
    ctx: &Context,
    secrets: &Api<Secret>,
    root_secret: Secret,
) -> Result<Secret> {
    let old_cert: Option<ByteString> = root_secret
        .data
        .as_ref()
        .and_then(|data| data.get(OLD_CA_ROOT_CERT_KEY))
        .cloned();
    let Some(old_cert) = old_cert else {
        return Ok(root_secret);
    };
    if !is_expired(&old_cert.0)? {
        return Ok(root_secret);
    }

    info!("previous root CA expired, closing the overlap window");
    let name = &ctx.config.root_ca_secret_name;
    retry_on_conflict(secrets, name, |secret| {
        if let Some(data) = secret.data.as_mut() {
            data.remove(OLD_CA_ROOT_CERT_KEY);
        }
    })
    .await?;

    let updated = with_timeout(secrets.get(name)).await?;
    let bundle = ca_bundle_from_secret(&updated)?;
    inject_ca_bundle(&ctx.client, &bundle).await?;

    Ok(updated)
}

/// Phase 3: re-verify the controller's own webhook certificate and every
/// policy-server certificate against the current root, regenerating the
/// ones that are expiring, mis-named or unsigned.
async fn refresh_server_certs(
    ctx: &Context,
    secrets: &Api<Secret>,
    ca: &CertificateAuthority,
) -> Result<()> {
    let controller_san = format!(
        "{}.{}.svc",
        ctx.config.webhook_service_name, ctx.config.deployment_namespace
    );
    refresh_one_server_cert(
        secrets,
        &ctx.config.deployment_namespace,
        &ctx.config.webhook_cert_secret_name,
        &controller_san,
        ca,
        true,
    )
    .await?;

    let labelled = ListParams::default().labels(&format!(
        "{PART_OF_LABEL_KEY}={PART_OF_LABEL_VALUE},{POLICY_SERVER_LABEL_KEY}"
    ));
    let server_secrets = with_timeout(secrets.list(&labelled)).await?;
    for secret in server_secrets {
        let Some(name) = secret.metadata.name.clone() else {
            continue;
        };
        let san = format!("{}.{}.svc", name, ctx.config.deployment_namespace);
        refresh_one_server_cert(secrets, &ctx.config.deployment_namespace, &name, &san, ca, false)
            .await?;
    }

    Ok(())
}

async fn refresh_one_server_cert(
    secrets: &Api<Secret>,
    namespace: &str,
    name: &str,
    san: &str,
    ca: &CertificateAuthority,
    create_if_missing: bool,
) -> Result<()> {
    let existing = with_timeout(secrets.get_opt(name)).await?;

    let needs_refresh = match &existing {
        None => {
            if !create_if_missing {
                return Ok(());
            }
            true
        }
        Some(secret) => {
            let cert = secret
                .data
                .as_ref()
                .and_then(|data| data.get(SERVER_CERT_KEY));
            match cert {
                None => true,
                Some(cert_pem) => {
                    match verify_server_cert(&cert_pem.0, ca.cert_pem.as_bytes(), san) {
                        Ok(()) => false,
                        Err(reason) => {
                            warn!(secret = name, %reason, "server certificate needs refresh");
                            true
                        }
                    }
                }
            }
        }
    };
    if !needs_refresh {
        return Ok(());
    }

    let pair = ca.sign_server_cert(san)?;
    let data = server_cert_secret_data(&pair);

    match existing {
        None => {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                data: Some(data),
                type_: Some("Opaque".to_string()),
                ..Default::default()
            };
            with_timeout(secrets.create(&PostParams::default(), &secret)).await?;
        }
        Some(_) => {
            retry_on_conflict(secrets, name, |secret| {
                let updated = secret
                    .data
                    .get_or_insert_with(Default::default);
                for (key, value) in &data {
                    updated.insert(key.clone(), value.clone());
                }
            })
            .await?;
        }
    }

    info!(secret = name, san, "server certificate renewed");
    Ok(())
}
