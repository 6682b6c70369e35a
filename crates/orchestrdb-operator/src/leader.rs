//! Leader election on a `coordination.k8s.io/v1` Lease
//!
//! Only the replica holding the lease runs the controllers. The holder renews
//! the lease every retry period; a replica that cannot renew within the renew
//! deadline stops its controllers and reports [`OperatorError::LeadershipLost`].

use crate::error::{OperatorError, Result};
use crate::store::LeaseStore;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default name of the Lease object
pub const DEFAULT_LEASE_NAME: &str = "orchestrdb-operator.mertsaygi.net";

/// Timing and identity for one elector
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    /// Unique name of this replica, usually the pod name
    pub identity: String,
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How long the holder keeps leading while renewals fail
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    pub fn with_lease_name(mut self, name: impl Into<String>) -> Self {
        self.lease_name = name.into();
        self
    }
}

/// What this replica may do with the current lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseClaim {
    /// We hold it and extend it
    Renew,
    /// Free or expired, take it over
    Acquire,
    /// Held by another live replica
    Held(String),
}

/// Decide what `identity` may do with a lease in state `spec`
pub fn evaluate_lease(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseClaim {
    let Some(spec) = spec else {
        return LeaseClaim::Acquire;
    };
    let holder = match spec.holder_identity.as_deref() {
        Some(holder) if !holder.is_empty() => holder,
        _ => return LeaseClaim::Acquire,
    };
    if holder == identity {
        return LeaseClaim::Renew;
    }

    let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(MicroTime(renewed)), Some(seconds)) => {
            *renewed + chrono::Duration::seconds(i64::from(seconds)) < now
        }
        _ => true,
    };
    if expired {
        LeaseClaim::Acquire
    } else {
        LeaseClaim::Held(holder.to_string())
    }
}

/// Lease spec after `identity` renews or acquires
fn claimed_spec(
    current: Option<&LeaseSpec>,
    claim: &LeaseClaim,
    identity: &str,
    lease_duration: Duration,
    now: DateTime<Utc>,
) -> LeaseSpec {
    let previous = current.cloned().unwrap_or_default();
    let had_holder = previous
        .holder_identity
        .as_deref()
        .is_some_and(|h| !h.is_empty());

    let (acquire_time, transitions) = match claim {
        LeaseClaim::Renew => (previous.acquire_time.clone(), previous.lease_transitions),
        _ => {
            let transitions = previous.lease_transitions.unwrap_or(0);
            (
                Some(MicroTime(now)),
                Some(if had_holder { transitions + 1 } else { transitions }),
            )
        }
    };

    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(lease_duration.as_secs().try_into().unwrap_or(i32::MAX)),
        acquire_time,
        renew_time: Some(MicroTime(now)),
        lease_transitions: transitions,
        ..previous
    }
}

/// Acquires, renews and releases the operator's Lease
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaderElectionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LeaderElectionConfig {
        &self.config
    }

    /// One acquire-or-renew attempt; `true` when we hold the lease afterwards
    pub async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool> {
        let namespace = &self.config.namespace;
        let identity = &self.config.identity;

        let Some(lease) = self.store.get(namespace, &self.config.lease_name).await? else {
            let spec = claimed_spec(
                None,
                &LeaseClaim::Acquire,
                identity,
                self.config.lease_duration,
                now,
            );
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.config.lease_name.clone()),
                    namespace: Some(namespace.clone()),
                    ..Default::default()
                },
                spec: Some(spec),
            };
            return self.store.create(namespace, &lease).await;
        };

        let claim = evaluate_lease(lease.spec.as_ref(), identity, now);
        if let LeaseClaim::Held(holder) = &claim {
            debug!(holder = %holder, "Lease held by another replica");
            return Ok(false);
        }

        let spec = claimed_spec(
            lease.spec.as_ref(),
            &claim,
            identity,
            self.config.lease_duration,
            now,
        );
        let updated = Lease {
            metadata: lease.metadata,
            spec: Some(spec),
        };
        self.store.replace(namespace, &updated).await
    }

    /// Give the lease up so another replica can take over at once
    pub async fn release(&self) -> Result<()> {
        let namespace = &self.config.namespace;
        let Some(lease) = self.store.get(namespace, &self.config.lease_name).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return Ok(());
        }

        let released = Lease {
            metadata: lease.metadata,
            spec: Some(LeaseSpec {
                holder_identity: None,
                lease_duration_seconds: Some(1),
                ..spec
            }),
        };
        self.store.replace(namespace, &released).await?;
        info!(lease = %self.config.lease_name, "Released leader lease");
        Ok(())
    }

    /// Block until this replica holds the lease; `false` if `cancel` fired first
    async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed to acquire leader lease"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keep renewing until `leading` is cancelled or the lease is lost
    async fn hold(&self, leading: &CancellationToken) -> Result<()> {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = leading.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => last_renewal = Instant::now(),
                Ok(false) => {
                    return Err(OperatorError::LeadershipLost(format!(
                        "lease {} taken over by another replica",
                        self.config.lease_name
                    )));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to renew leader lease");
                    if last_renewal.elapsed() >= self.config.renew_deadline {
                        return Err(OperatorError::LeadershipLost(format!(
                            "lease {} not renewed within {}s",
                            self.config.lease_name,
                            self.config.renew_deadline.as_secs()
                        )));
                    }
                }
            }
        }
    }

    /// Run `work` while this replica leads
    ///
    /// `work` receives a token that is cancelled on shutdown or when the lease
    /// is lost. The lease is released after a clean shutdown.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, work: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        info!(
            lease = %self.config.lease_name,
            namespace = %self.config.namespace,
            identity = %self.config.identity,
            "Waiting for leader lease"
        );
        if !self.acquire(&cancel).await {
            return Ok(());
        }
        info!(identity = %self.config.identity, "Acquired leader lease");

        let leading = cancel.child_token();
        let work = work(leading.clone());
        tokio::pin!(work);

        let result = tokio::select! {
            result = &mut work => result,
            held = self.hold(&leading) => {
                leading.cancel();
                let result = (&mut work).await;
                held.and(result)
            }
        };

        match &result {
            Err(OperatorError::LeadershipLost(reason)) => {
                warn!(reason = %reason, "Lost leader lease");
            }
            _ => {
                if let Err(e) = self.release().await {
                    warn!(error = %e, "Failed to release leader lease");
                }
            }
        }
        result
    }
}
