//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use orchestrdb_operator::access::AccessGrant;
use orchestrdb_operator::config::OperatorConfig;
use orchestrdb_operator::controller::ControllerContext;
use orchestrdb_operator::credentials::{AdminCredentials, CredentialResolver};
use orchestrdb_operator::crd::{
    AccessRule, Database, DatabaseSpec, GeneratedSecretRef, ProvisionStatus, SecretRef, User,
    UserSpec,
};
use orchestrdb_operator::database::DatabaseEngine;
use orchestrdb_operator::database_controller::DatabaseContext;
use orchestrdb_operator::error::{OperatorError, Result};
use orchestrdb_operator::password::PasswordGenerator;
use orchestrdb_operator::postgres::{AdminExecutor, ServerTarget};
use orchestrdb_operator::store::{ResourceStore, SecretStore};
use orchestrdb_operator::user::UserEngine;
use orchestrdb_operator::user_controller::UserContext;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const NAMESPACE: &str = "default";

/// Objects whose status the fake store can write back
pub trait WithStatus {
    fn set_status(&mut self, status: ProvisionStatus);
}

impl WithStatus for Database {
    fn set_status(&mut self, status: ProvisionStatus) {
        self.status = Some(status);
    }
}

impl WithStatus for User {
    fn set_status(&mut self, status: ProvisionStatus) {
        self.status = Some(status);
    }
}

/// Resource store keeping objects and every status write in memory
pub struct MemoryResourceStore<K> {
    objects: Mutex<BTreeMap<String, K>>,
    writes: Mutex<Vec<ProvisionStatus>>,
    fail_status_writes: AtomicBool,
}

impl<K> Default for MemoryResourceStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            fail_status_writes: AtomicBool::new(false),
        }
    }
}

impl<K: kube::ResourceExt + Clone> MemoryResourceStore<K> {
    pub fn insert(&self, obj: K) {
        let key = format!(
            "{}/{}",
            obj.namespace().unwrap_or_default(),
            obj.name_any()
        );
        self.objects.lock().unwrap().insert(key, obj);
    }

    pub fn get_object(&self, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&format!("{}/{}", NAMESPACE, name))
            .cloned()
    }

    pub fn status_writes(&self) -> Vec<ProvisionStatus> {
        self.writes.lock().unwrap().clone()
    }

    pub fn last_status(&self) -> ProvisionStatus {
        self.writes
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no status written")
    }

    pub fn fail_status_writes(&self, fail: bool) {
        self.fail_status_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryResourceStore<K>
where
    K: WithStatus + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned())
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ProvisionStatus,
    ) -> Result<()> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            return Err(OperatorError::ValidationError(
                "status subresource unavailable".to_string(),
            ));
        }
        self.writes.lock().unwrap().push(status.clone());
        if let Some(obj) = self
            .objects
            .lock()
            .unwrap()
            .get_mut(&format!("{}/{}", namespace, name))
        {
            obj.set_status(status.clone());
        }
        Ok(())
    }
}

/// Secret store backed by a map
///
/// Lookups can be made to fail, and creates can be made to lose a race
/// against another writer.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<String, Secret>>,
    get_failure: Mutex<Option<String>>,
    lose_create_race: AtomicBool,
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

    pub fn get_secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.secrets.lock().unwrap().len()
    }

    /// Make every `get` fail with an API server error
    pub fn fail_gets(&self, message: &str) {
        *self.get_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Have another writer create the secret just before each `create`
    pub fn lose_create_race(&self) {
        self.lose_create_race.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        if let Some(message) = self.get_failure.lock().unwrap().clone() {
            return Err(OperatorError::KubeError(kube::Error::Api(
                kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message,
                    reason: "InternalError".to_string(),
                    code: 500,
                },
            )));
        }
        Ok(self.get_secret(namespace, name))
    }

    async fn create(&self, secret: Secret) -> Result<()> {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let name = secret.metadata.name.clone().unwrap_or_default();
        let key = format!("{}/{}", namespace, name);
        let mut secrets = self.secrets.lock().unwrap();
        if self.lose_create_race.load(Ordering::SeqCst) {
            let winner = Secret {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.clone()),
                    ..Default::default()
                },
                ..Default::default()
            };
            secrets.insert(key.clone(), winner);
        }
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

/// A call received by [`RecordingExecutor`]
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorCall {
    CreateDatabase {
        target: ServerTarget,
        admin_user: String,
        admin_password: String,
        name: String,
    },
    EnsureUser {
        target: ServerTarget,
        admin_user: String,
        username: String,
        password: String,
        grants: Vec<AccessGrant>,
    },
}

/// Executor recording every call, optionally failing them
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<ExecutorCall>>,
    databases: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
}

impl RecordingExecutor {
    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        match self.failure.lock().unwrap().clone() {
            Some(message) => Err(OperatorError::Transport {
                operation: operation.to_string(),
                message,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AdminExecutor for RecordingExecutor {
    async fn create_database(
        &self,
        target: &ServerTarget,
        admin: &AdminCredentials,
        name: &str,
    ) -> Result<bool> {
        self.calls.lock().unwrap().push(ExecutorCall::CreateDatabase {
            target: target.clone(),
            admin_user: admin.user.clone(),
            admin_password: admin.password.expose_secret().to_string(),
            name: name.to_string(),
        });
        self.check_failure("create database")?;

        let mut databases = self.databases.lock().unwrap();
        if databases.iter().any(|d| d == name) {
            return Ok(false);
        }
        databases.push(name.to_string());
        Ok(true)
    }

    async fn ensure_user(
        &self,
        target: &ServerTarget,
        admin: &AdminCredentials,
        username: &str,
        password: &SecretString,
        grants: &[AccessGrant],
    ) -> Result<()> {
        self.calls.lock().unwrap().push(ExecutorCall::EnsureUser {
            target: target.clone(),
            admin_user: admin.user.clone(),
            username: username.to_string(),
            password: password.expose_secret().to_string(),
            grants: grants.to_vec(),
        });
        self.check_failure("ensure user")
    }
}

/// Everything a Database reconcile test needs
pub struct DatabaseHarness {
    pub resources: Arc<MemoryResourceStore<Database>>,
    pub secrets: Arc<MemorySecretStore>,
    pub executor: Arc<RecordingExecutor>,
    pub ctx: Arc<DatabaseContext>,
}

impl DatabaseHarness {
    pub fn new() -> Self {
        let resources = Arc::new(MemoryResourceStore::<Database>::default());
        let secrets = Arc::new(MemorySecretStore::default());
        let executor = Arc::new(RecordingExecutor::default());

        let ctx = Arc::new(ControllerContext::new(
            resources.clone() as Arc<dyn ResourceStore<Database>>,
            CredentialResolver::new(secrets.clone()),
            DatabaseEngine::new(executor.clone()),
            OperatorConfig::default(),
        ));

        Self {
            resources,
            secrets,
            executor,
            ctx,
        }
    }
}

/// Everything a User reconcile test needs
pub struct UserHarness {
    pub resources: Arc<MemoryResourceStore<User>>,
    pub secrets: Arc<MemorySecretStore>,
    pub executor: Arc<RecordingExecutor>,
    pub ctx: Arc<UserContext>,
}

impl UserHarness {
    pub fn new() -> Self {
        let resources = Arc::new(MemoryResourceStore::<User>::default());
        let secrets = Arc::new(MemorySecretStore::default());
        let executor = Arc::new(RecordingExecutor::default());

        let engine = UserEngine::new(
            executor.clone(),
            secrets.clone(),
            Arc::new(PasswordGenerator::default()),
        );
        let ctx = Arc::new(ControllerContext::new(
            resources.clone() as Arc<dyn ResourceStore<User>>,
            CredentialResolver::new(secrets.clone()),
            engine,
            OperatorConfig::default(),
        ));

        Self {
            resources,
            secrets,
            executor,
            ctx,
        }
    }
}

/// Database with inline admin credentials
pub fn database(name: &str, generation: Option<i64>) -> Database {
    let mut db = Database::new(
        name,
        DatabaseSpec {
            host: "db".to_string(),
            port: 5432,
            admin_user: Some("admin".to_string()),
            admin_password: Some("pw".to_string()),
            admin_secret_ref: None,
            name: name.to_string(),
            ssl_mode: None,
        },
    );
    db.metadata.namespace = Some(NAMESPACE.to_string());
    db.metadata.generation = generation;
    db
}

/// User with inline admin credentials and the given access rules
pub fn user(username: &str, secret_name: &str, access: Vec<AccessRule>) -> User {
    let mut user = User::new(
        username,
        UserSpec {
            host: "db".to_string(),
            port: 5432,
            admin_user: Some("admin".to_string()),
            admin_password: Some("pw".to_string()),
            admin_secret_ref: None,
            ssl_mode: None,
            username: username.to_string(),
            generated_secret_ref: GeneratedSecretRef {
                name: secret_name.to_string(),
                namespace: None,
            },
            access,
        },
    );
    user.metadata.namespace = Some(NAMESPACE.to_string());
    user.metadata.generation = Some(1);
    user
}

pub fn rule(db_name: &str, role: Option<&str>, scope: Option<&str>) -> AccessRule {
    AccessRule {
        db_name: Some(db_name.to_string()),
        role: role.map(str::to_string),
        scope: scope.map(str::to_string),
    }
}

pub fn secret_ref(name: &str) -> SecretRef {
    SecretRef {
        name: name.to_string(),
        ..Default::default()
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
