//! User convergence
//!
//! A pass over a [`User`] runs strictly in order and stops at the first
//! failure: guard the destination secret, validate access rules, generate a
//! password, write the secret, upsert the role, apply grants. Nothing already
//! applied is rolled back when a later step fails.

use crate::access::validate_rules;
use crate::crd::{GeneratedSecretRef, User, DEFAULT_PASSWORD_KEY, DEFAULT_USER_KEY};
use crate::credentials::AdminCredentials;
use crate::error::{OperatorError, Result};
use crate::password::PasswordGenerator;
use crate::postgres::{AdminExecutor, ServerTarget};
use crate::store::SecretStore;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Label marking secrets written by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "orchestrdb-operator";

/// Annotation naming the User a generated secret belongs to
pub const OWNER_ANNOTATION: &str = "orchestrdb.mertsaygi.net/owner";

pub const SECRET_EXISTS_MESSAGE: &str = "generatedSecret already exists; refusing to overwrite";
pub const SECRET_CREATE_RACE_MESSAGE: &str = "generatedSecret already exists during create";

/// Creates login roles and their credential secrets
#[derive(Clone)]
pub struct UserEngine {
    executor: Arc<dyn AdminExecutor>,
    secrets: Arc<dyn SecretStore>,
    passwords: Arc<PasswordGenerator>,
}

impl UserEngine {
    pub fn new(
        executor: Arc<dyn AdminExecutor>,
        secrets: Arc<dyn SecretStore>,
        passwords: Arc<PasswordGenerator>,
    ) -> Self {
        Self {
            executor,
            secrets,
            passwords,
        }
    }

    /// Refuse to proceed when the destination secret already exists
    ///
    /// Runs before anything else in a pass, admin credentials included.
    pub async fn check_generated_secret(
        &self,
        owner_namespace: &str,
        reference: &GeneratedSecretRef,
    ) -> Result<()> {
        let namespace = reference.effective_namespace(owner_namespace);
        match self.secrets.get(namespace, &reference.name).await? {
            Some(_) => Err(OperatorError::Conflict(SECRET_EXISTS_MESSAGE.to_string())),
            None => Ok(()),
        }
    }

    /// Converge the role described by `user`
    #[instrument(skip(self, user, target, admin), fields(username = %user.spec.username, server = %target))]
    pub async fn ensure_user(
        &self,
        user: &User,
        target: &ServerTarget,
        admin: &AdminCredentials,
    ) -> Result<()> {
        let grants = validate_rules(&user.spec.access)?;
        let password = self.passwords.generate()?;

        let owner_namespace = user.namespace().unwrap_or_else(|| "default".to_string());
        let secret = build_generated_secret(user, &owner_namespace, &password);
        match self.secrets.create(secret).await {
            Ok(()) => {}
            Err(OperatorError::AlreadyExists { .. }) => {
                return Err(OperatorError::Conflict(SECRET_CREATE_RACE_MESSAGE.to_string()));
            }
            Err(e) => return Err(e),
        }
        debug!(secret = %user.spec.generated_secret_ref.name, "Wrote generated credentials");

        self.executor
            .ensure_user(target, admin, &user.spec.username, &password, &grants)
            .await?;

        info!(username = %user.spec.username, rules = grants.len(), "User converged");
        Ok(())
    }
}

/// Secret holding the generated username and password
fn build_generated_secret(user: &User, owner_namespace: &str, password: &SecretString) -> Secret {
    let reference = &user.spec.generated_secret_ref;

    let labels = BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())]);
    let annotations = BTreeMap::from([(
        OWNER_ANNOTATION.to_string(),
        format!("User/{}/{}", owner_namespace, user.name_any()),
    )]);
    let string_data = BTreeMap::from([
        (DEFAULT_USER_KEY.to_string(), user.spec.username.clone()),
        (
            DEFAULT_PASSWORD_KEY.to_string(),
            password.expose_secret().to_string(),
        ),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(reference.name.clone()),
            namespace: Some(reference.effective_namespace(owner_namespace).to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}
