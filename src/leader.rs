//! Single active replica through a coordination `Lease`.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    api::{Api, PostParams},
    Client,
};
use tracing::{debug, info, warn};

use crate::{resources::meta, Error, Metrics, Result};

/// Lease shared by every replica of the operator
pub const LEASE_NAME: &str = "2b63967d.openshift.io";

const DEFAULT_NAMESPACE: &str = "openshift-gitops-operator";

#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    /// Identity written into the lease, the pod name when known
    pub holder: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
}

impl LeaseConfig {
    pub fn from_env() -> Self {
        let holder = std::env::var("POD_NAME")
            .unwrap_or_else(|_| format!("{}-{}", crate::OPERATOR_NAME, uuid::Uuid::new_v4()));
        let namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.into());

        Self {
            name: LEASE_NAME.into(),
            namespace,
            holder,
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }
}

pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaseConfig,
    metrics: Metrics,
}

impl LeaderElector {
    pub fn new(client: Client, config: LeaseConfig, metrics: Metrics) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
            metrics,
        }
    }

    /// Wait until this replica holds the lease
    pub async fn acquire(&self) {
        info!(
            "Waiting for lease {}/{} as {}",
            self.config.namespace, self.config.name, self.config.holder
        );
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!("Leader election failed: {e}"),
            }
            tokio::time::sleep(self.config.renew_interval).await;
        }
        self.metrics.set_leader(true);
        info!("Acquired lease {}", self.config.name);
    }

    /// Keep renewing the lease, returning once it has been lost.
    ///
    /// Failed renewals are tolerated until the lease would have expired.
    pub async fn hold(&self) {
        let mut last_renewal = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.config.renew_interval).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!("Lease {} was taken over", self.config.name);
                    break;
                }
                Err(e) if last_renewal.elapsed() < self.config.lease_duration => {
                    debug!("Lease renewal failed, retrying: {e}");
                }
                Err(e) => {
                    warn!("Could not renew lease {} in time: {e}", self.config.name);
                    break;
                }
            }
        }
        self.metrics.set_leader(false);
    }

    /// Release the lease so a standby replica does not wait for it to expire
    pub async fn step_down(&self) {
        let Ok(Some(mut lease)) = self.api.get_opt(&self.config.name).await else {
            return;
        };
        let Some(spec) = lease.spec.as_mut() else {
            return;
        };
        if spec.holder_identity.as_deref() != Some(self.config.holder.as_str()) {
            return;
        }

        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        match self
            .api
            .replace(&self.config.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => info!("Released lease {}", self.config.name),
            Err(e) => warn!("Failed to release lease {}: {e}", self.config.name),
        }
        self.metrics.set_leader(false);
    }

    /// Take the lease if it is free or expired, renew it if it is ours.
    ///
    /// Returns whether this replica holds the lease afterwards.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let duration = self.config.lease_duration.as_secs() as i32;

        let Some(mut lease) = self
            .api
            .get_opt(&self.config.name)
            .await
            .map_err(Error::KubeError)?
        else {
            let lease = Lease {
                metadata: meta! {
                    name: Some(self.config.name.clone()),
                    namespace: Some(self.config.namespace.clone()),
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.config.holder.clone()),
                    lease_duration_seconds: Some(duration),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(0),
                }),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(Error::KubeError(e)),
            };
        };

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        let ours = spec.holder_identity.as_deref() == Some(self.config.holder.as_str());
        if !ours {
            let expiry = spec.renew_time.as_ref().map(|renewed| {
                let held = spec.lease_duration_seconds.unwrap_or(duration);
                renewed.0 + chrono::Duration::seconds(i64::from(held))
            });
            let free = spec.holder_identity.as_deref().map_or(true, str::is_empty);
            if !free && expiry.is_some_and(|expiry| expiry > now) {
                debug!("Lease held by {:?}", spec.holder_identity);
                return Ok(false);
            }

            spec.holder_identity = Some(self.config.holder.clone());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.lease_duration_seconds = Some(duration);
        spec.renew_time = Some(MicroTime(now));

        match self
            .api
            .replace(&self.config.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}
