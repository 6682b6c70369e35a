//! In-memory fakes for unit tests

use crate::error::{OperatorError, Result};
use crate::store::{LeaseStore, SecretStore};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Secret store keyed by `namespace/name`
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<String, Secret>>,
}

impl MemorySecretStore {
    pub fn insert(&self, secret: Secret) {
        let key = format!(
            "{}/{}",
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default()
        );
        self.secrets.lock().unwrap().insert(key, secret);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned())
    }

    async fn create(&self, secret: Secret) -> Result<()> {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let name = secret.metadata.name.clone().unwrap_or_default();
        let mut secrets = self.secrets.lock().unwrap();
        let key = format!("{}/{}", namespace, name);
        if secrets.contains_key(&key) {
            return Err(OperatorError::AlreadyExists {
                kind: "Secret".to_string(),
                namespace,
                name,
            });
        }
        secrets.insert(key, secret);
        Ok(())
    }
}

/// Lease store with `resourceVersion` checks on replace
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<BTreeMap<String, Lease>>,
}

impl MemoryLeaseStore {
    pub fn holder(&self, namespace: &str, name: &str) -> Option<String> {
        self.leases
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| s.holder_identity.clone())
    }

    /// Hand a fresh lease to `holder`, as another replica would
    pub fn set_holder(&self, namespace: &str, name: &str, holder: &str) {
        let mut leases = self.leases.lock().unwrap();
        let key = format!("{}/{}", namespace, name);
        let version = leases
            .get(&key)
            .and_then(|l| l.metadata.resource_version.as_deref())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some((version + 1).to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.to_string()),
                lease_duration_seconds: Some(15),
                renew_time: Some(MicroTime(Utc::now())),
                ..Default::default()
            }),
        };
        leases.insert(key, lease);
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        Ok(self
            .leases
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned())
    }

    async fn create(&self, namespace: &str, lease: &Lease) -> Result<bool> {
        let name = lease.metadata.name.clone().unwrap_or_default();
        let mut leases = self.leases.lock().unwrap();
        let key = format!("{}/{}", namespace, name);
        if leases.contains_key(&key) {
            return Ok(false);
        }
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some("1".to_string());
        leases.insert(key, stored);
        Ok(true)
    }

    async fn replace(&self, namespace: &str, lease: &Lease) -> Result<bool> {
        let name = lease.metadata.name.clone().unwrap_or_default();
        let mut leases = self.leases.lock().unwrap();
        let key = format!("{}/{}", namespace, name);
        let Some(current) = leases.get(&key) else {
            return Ok(false);
        };
        if current.metadata.resource_version != lease.metadata.resource_version {
            return Ok(false);
        }
        let version = current
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some((version + 1).to_string());
        leases.insert(key, stored);
        Ok(true)
    }
}

/// Secret with the given `data` entries
pub fn secret(namespace: &str, name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}
