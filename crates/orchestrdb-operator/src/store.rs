//! Access to the Kubernetes resource store
//!
//! The reconcile passes only talk to the API server through these traits, so
//! they can run against in-memory fakes in tests.

use crate::crd::ProvisionStatus;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

/// Read and create Secrets
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a secret; never overwrites an existing one
    ///
    /// Returns [`OperatorError::AlreadyExists`] when the name is taken.
    async fn create(&self, secret: Secret) -> Result<()>;
}

/// Read reconciled resources and write their status
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    /// Fetch the current object, `None` when it was removed
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Persist the status subresource
    async fn update_status(&self, namespace: &str, name: &str, status: &ProvisionStatus)
        -> Result<()>;
}

/// Read, create and replace coordination Leases
///
/// `create` and `replace` return `false` when another writer got there first.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Lease>>;

    async fn create(&self, namespace: &str, lease: &Lease) -> Result<bool>;

    /// Replace guarded by the lease's `resourceVersion`
    async fn replace(&self, namespace: &str, lease: &Lease) -> Result<bool>;
}

/// Store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    /// Create a store writing as `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn post_params(&self) -> PostParams {
        post_params(&self.field_manager)
    }
}

fn post_params(field_manager: &str) -> PostParams {
    PostParams {
        field_manager: Some(field_manager.to_string()),
        ..Default::default()
    }
}

fn status_patch_params(field_manager: &str) -> PatchParams {
    PatchParams {
        field_manager: Some(field_manager.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl SecretStore for KubeStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(OperatorError::from)
    }

    async fn create(&self, secret: Secret) -> Result<()> {
        let namespace = secret.metadata.namespace.clone().ok_or_else(|| {
            OperatorError::ValidationError("secret is missing metadata.namespace".to_string())
        })?;
        let name = secret.metadata.name.clone().ok_or_else(|| {
            OperatorError::ValidationError("secret is missing metadata.name".to_string())
        })?;

        debug!(namespace = %namespace, name = %name, "Creating Secret");

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&self.post_params(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(OperatorError::AlreadyExists {
                kind: "Secret".to_string(),
                namespace,
                name,
            }),
            Err(e) => Err(OperatorError::from(e)),
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    <K as Resource>::DynamicType: Default,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(OperatorError::from)
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ProvisionStatus,
    ) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);

        debug!(name = %name, created = status.created, "Updating status");

        let patch = serde_json::json!({
            "status": status
        });

        let params = status_patch_params(&self.field_manager);
        api.patch_status(name, &params, &Patch::Merge(&patch))
            .await
            .map_err(OperatorError::from)?;

        Ok(())
    }
}

#[async_trait]
impl LeaseStore for KubeStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(OperatorError::from)
    }

    async fn create(&self, namespace: &str, lease: &Lease) -> Result<bool> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&self.post_params(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(OperatorError::from(e)),
        }
    }

    async fn replace(&self, namespace: &str, lease: &Lease) -> Result<bool> {
        let name = lease.metadata.name.clone().ok_or_else(|| {
            OperatorError::ValidationError("lease is missing metadata.name".to_string())
        })?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        match api.replace(&name, &self.post_params(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(OperatorError::from(e)),
        }
    }
}
