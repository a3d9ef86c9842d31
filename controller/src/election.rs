//! Lease-based leader election.
//!
//! One Lease object in the controller's own namespace arbitrates which
//! replica drives the store; standby replicas keep serving webhook traffic
//! but defer state-changing work. Leadership is published through a watch
//! latch that the delete workers and the admission handler consult before
//! mutating.

use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ControllerResult;
use crate::identity::PodIdentity;

const LEASE_NAME: &str = "port-allocator";
const LEASE_DURATION_SECONDS: i32 = 15;
/// A holder that cannot renew within this window steps down.
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

pub struct Elector {
    leases: Api<Lease>,
    identity: String,
}

impl Elector {
    pub fn new(client: Client, identity: &PodIdentity) -> Self {
        Self {
            leases: Api::namespaced(client, &identity.namespace),
            identity: identity.name.clone(),
        }
    }

    /// Acquire and renew the lease until shutdown, publishing leadership
    /// through `latch`. The lease is released on the way out so a standby
    /// can take over immediately.
    pub async fn run(self, latch: watch::Sender<bool>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(RETRY_PERIOD);
        let mut last_renew: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    if !*latch.borrow() {
                        info!(lease = LEASE_NAME, identity = %self.identity, "acquired leadership");
                    }
                    last_renew = Some(Instant::now());
                    let _ = latch.send(true);
                }
                Ok(false) => {
                    if *latch.borrow() {
                        info!(lease = LEASE_NAME, "lost leadership");
                    }
                    last_renew = None;
                    let _ = latch.send(false);
                }
                Err(e) => {
                    warn!(error = %e, "lease renewal attempt failed");
                    // ride out transient API failures, but never claim
                    // leadership past the renew deadline
                    if *latch.borrow()
                        && last_renew.is_none_or(|at| at.elapsed() >= RENEW_DEADLINE)
                    {
                        warn!("renew deadline exceeded, stepping down");
                        let _ = latch.send(false);
                    }
                }
            }
        }

        if *latch.borrow() {
            let _ = latch.send(false);
            match self.release().await {
                Ok(()) => info!(lease = LEASE_NAME, "released lease"),
                Err(e) => warn!(error = %e, "failed to release lease on shutdown"),
            }
        }
    }

    /// One acquisition attempt. `Ok(true)` means this replica holds the
    /// lease after the call; a lost optimistic-concurrency race is
    /// `Ok(false)`, not an error.
    async fn try_acquire_or_renew(&self) -> ControllerResult<bool> {
        let now = MicroTime(Utc::now());
        match self.leases.get_opt(LEASE_NAME).await? {
            None => {
                let lease = self.held_lease(&now, &now, 0);
                match self.leases.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Some(mut lease) => {
                let spec = lease.spec.clone().unwrap_or_default();
                let holder = spec.holder_identity.clone().unwrap_or_default();
                if holder == self.identity {
                    lease.spec = Some(LeaseSpec {
                        renew_time: Some(now),
                        ..spec
                    });
                    self.replace(lease).await
                } else if holder.is_empty() || expired(&spec, Utc::now()) {
                    let transitions = spec.lease_transitions.unwrap_or(0).saturating_add(1);
                    let acquire = now.clone();
                    lease.spec = Some(self.held_spec(&acquire, &now, transitions));
                    self.replace(lease).await
                } else {
                    debug!(lease = LEASE_NAME, holder = %holder, "lease held by another replica");
                    Ok(false)
                }
            }
        }
    }

    async fn replace(&self, lease: Lease) -> ControllerResult<bool> {
        match self
            .leases
            .replace(LEASE_NAME, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            // conflict on resourceVersion: another replica won the race
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn held_spec(&self, acquired: &MicroTime, renewed: &MicroTime, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: Some(acquired.clone()),
            renew_time: Some(renewed.clone()),
            lease_transitions: Some(transitions),
            ..LeaseSpec::default()
        }
    }

    fn held_lease(&self, acquired: &MicroTime, renewed: &MicroTime, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(self.held_spec(acquired, renewed, transitions)),
        }
    }

    /// Clear the holder so the next acquisition attempt by any replica wins
    /// without waiting for expiry.
    async fn release(&self) -> ControllerResult<()> {
        if let Some(mut lease) = self.leases.get_opt(LEASE_NAME).await? {
            let spec = lease.spec.clone().unwrap_or_default();
            if spec.holder_identity.as_deref() == Some(self.identity.as_str()) {
                lease.spec = Some(LeaseSpec {
                    holder_identity: None,
                    acquire_time: None,
                    renew_time: None,
                    ..spec
                });
                self.replace(lease).await?;
            }
        }
        Ok(())
    }
}

/// A lease is expired when its last renewal is older than its duration.
/// A lease that never recorded a renewal is treated as expired.
fn expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let Some(renew) = &spec.renew_time else {
        return true;
    };
    let duration = i64::from(spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS));
    renew.0 + TimeDelta::seconds(duration) < now
}
