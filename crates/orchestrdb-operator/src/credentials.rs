//! Admin credential resolution
//!
//! A resource names its admin credentials either inline or through a
//! [`SecretRef`]. The reference always wins when present. Values are looked
//! up fresh on every pass, so a rotated secret is picked up on the next
//! trigger without restarting the operator.

use crate::crd::{AdminConnectionSpec, SecretRef};
use crate::error::{OperatorError, Result};
use crate::store::SecretStore;
use k8s_openapi::api::core::v1::Secret;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::debug;

/// Resolved administrative login
#[derive(Clone)]
pub struct AdminCredentials {
    pub user: String,
    pub password: SecretString,
}

impl AdminCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: SecretString::from(password.into()),
        }
    }
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Resolves admin credentials from inline fields or a referenced secret
#[derive(Clone)]
pub struct CredentialResolver {
    secrets: Arc<dyn SecretStore>,
}

impl CredentialResolver {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    /// Resolve the admin credentials of a resource living in `owner_namespace`
    pub async fn resolve<S>(&self, spec: &S, owner_namespace: &str) -> Result<AdminCredentials>
    where
        S: AdminConnectionSpec + Sync + ?Sized,
    {
        match spec.admin_secret_ref() {
            Some(reference) if !reference.name.is_empty() => {
                self.resolve_reference(reference, owner_namespace).await
            }
            _ => resolve_inline(spec.admin_user(), spec.admin_password()),
        }
    }

    async fn resolve_reference(
        &self,
        reference: &SecretRef,
        owner_namespace: &str,
    ) -> Result<AdminCredentials> {
        let namespace = reference.effective_namespace(owner_namespace);

        debug!(secret = %reference.name, namespace = %namespace, "Resolving admin credentials from secret");

        let secret = self
            .secrets
            .get(namespace, &reference.name)
            .await?
            .ok_or_else(|| OperatorError::SecretNotFound {
                namespace: namespace.to_string(),
                name: reference.name.clone(),
            })?;

        let user = secret_value(&secret, reference.user_key(), namespace, &reference.name)?;
        let password = secret_value(&secret, reference.password_key(), namespace, &reference.name)?;

        Ok(AdminCredentials::new(user, password))
    }
}

fn resolve_inline(user: Option<&str>, password: Option<&str>) -> Result<AdminCredentials> {
    match (user, password) {
        (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
            Ok(AdminCredentials::new(user, password))
        }
        _ => Err(OperatorError::ValidationError(
            "adminUser/adminPassword or adminSecretRef must be provided".to_string(),
        )),
    }
}

/// Read one key from a secret, preferring `data` over `stringData`
fn secret_value(secret: &Secret, key: &str, namespace: &str, name: &str) -> Result<String> {
    if let Some(bytes) = secret.data.as_ref().and_then(|data| data.get(key)) {
        return String::from_utf8(bytes.0.clone()).map_err(|_| {
            OperatorError::ValidationError(format!(
                "key '{}' in secret {}/{} is not valid UTF-8",
                key, namespace, name
            ))
        });
    }

    if let Some(value) = secret.string_data.as_ref().and_then(|data| data.get(key)) {
        return Ok(value.clone());
    }

    Err(OperatorError::KeyMissing {
        key: key.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}
