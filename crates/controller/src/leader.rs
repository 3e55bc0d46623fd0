//! Lease-based leader election. One Lease gates the whole manager: the
//! certificate reconciler must be a singleton (it rewrites the shared root
//! CA secret), and running the remaining reconcilers on the leader only
//! keeps writer races out of the picture entirely.

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};

pub const LEASE_NAME: &str = "kubewarden-controller-lock";

const LEASE_DURATION_SECONDS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

pub struct LeaderElector {
    api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: String) -> Self {
        LeaderElector {
            api: Api::namespaced(client, namespace),
            identity,
        }
    }

    /// Blocks until this instance holds the lease.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = self.identity.as_str(), "leader election won");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("lease is held by another instance");
                }
                Err(e) if e.is_conflict() => {
                    debug!("lost the acquisition race");
                }
                Err(e) => return Err(e),
            }
            sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renews the lease until the process stops. Failing to renew means
    /// another instance may take over; continuing to run unelected would
    /// reintroduce the writer races leadership exists to prevent, so the
    /// caller treats the returned error as fatal.
    pub async fn keep_renewing(&self) -> Result<()> {
        loop {
            sleep(RENEW_INTERVAL).await;
            if let Err(e) = self.renew().await {
                warn!(error = %e, "cannot renew leadership lease");
                return Err(Error::LeadershipLost(LEASE_NAME.to_string()));
            }
        }
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(k8s_openapi::jiff::Timestamp::now());

        match self.api.get_opt(LEASE_NAME).await? {
            None => {
                let lease = self.desired_lease(None, now);
                self.api.create(&PostParams::default(), &lease).await?;
                Ok(true)
            }
            Some(current) => {
                let spec = current.spec.clone().unwrap_or_default();
                if spec.holder_identity.as_deref() == Some(self.identity.as_str()) {
                    return Ok(true);
                }
                if !lease_expired(&spec, &now) {
                    return Ok(false);
                }

                let mut lease = self.desired_lease(Some(&current), now);
                lease.metadata.resource_version = current.metadata.resource_version.clone();
                self.api
                    .replace(LEASE_NAME, &PostParams::default(), &lease)
                    .await?;
                Ok(true)
            }
        }
    }

    async fn renew(&self) -> Result<()> {
        let now = MicroTime(k8s_openapi::jiff::Timestamp::now());
        let current = self
            .api
            .get_opt(LEASE_NAME)
            .await?
            .ok_or_else(|| Error::LeadershipLost(LEASE_NAME.to_string()))?;

        let spec = current.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Err(Error::LeadershipLost(LEASE_NAME.to_string()));
        }

        let mut lease = current;
        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(now);
        }
        self.api
            .replace(LEASE_NAME, &PostParams::default(), &lease)
            .await?;
        Ok(())
    }

    fn desired_lease(&self, previous: Option<&Lease>, now: MicroTime) -> Lease {
        let transitions = previous
            .and_then(|lease| lease.spec.as_ref())
            .and_then(|spec| spec.lease_transitions)
            .unwrap_or(0);

        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(transitions + 1),
                ..Default::default()
            }),
        }
    }
}

fn lease_expired(spec: &LeaseSpec, now: &MicroTime) -> bool {
    let Some(renew_time) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };
    let duration = spec
        .lease_duration_seconds
        .unwrap_or(LEASE_DURATION_SECONDS);
    renew_time.0 + k8s_openapi::jiff::Span::new().seconds(duration) < now.0
}
