//! Administrative PostgreSQL executor
//!
//! [`AdminExecutor`] is the seam between the convergence engines and the
//! database server. [`PostgresExecutor`] implements it with `tokio-postgres`,
//! opening fresh sessions for every call and closing them before returning.

use crate::access::{plan_all, quote_ident, quote_literal, AccessGrant, GrantSession};
use crate::crd::{AdminConnectionSpec, SslMode};
use crate::credentials::AdminCredentials;
use crate::error::{OperatorError, Result};
use crate::tls::{driver_ssl_mode, make_tls_connector};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Database every administrative session connects to first
pub const BOOTSTRAP_DATABASE: &str = "postgres";

/// Server an administrative operation runs against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
    pub ssl_mode: SslMode,
}

impl ServerTarget {
    /// Target described by a resource spec
    pub fn from_spec<S: AdminConnectionSpec + ?Sized>(spec: &S) -> Result<Self> {
        let port = u16::try_from(spec.port())
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                OperatorError::ValidationError(format!(
                    "port must be between 1 and 65535, got {}",
                    spec.port()
                ))
            })?;

        Ok(Self {
            host: spec.host().to_string(),
            port,
            ssl_mode: spec.ssl_mode(),
        })
    }
}

impl std::fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Administrative operations against a PostgreSQL server
#[async_trait]
pub trait AdminExecutor: Send + Sync {
    /// Create a database; an existing database counts as success
    ///
    /// Returns `true` when the database was created by this call.
    async fn create_database(
        &self,
        target: &ServerTarget,
        admin: &AdminCredentials,
        name: &str,
    ) -> Result<bool>;

    /// Create or update a login role and apply its grants in order
    async fn ensure_user(
        &self,
        target: &ServerTarget,
        admin: &AdminCredentials,
        username: &str,
        password: &SecretString,
        grants: &[AccessGrant],
    ) -> Result<()>;
}

/// An open administrative session
struct Session {
    client: Client,
    connection: JoinHandle<()>,
}

impl Session {
    async fn close(self) {
        drop(self.client);
        let _ = self.connection.await;
    }
}

/// [`AdminExecutor`] backed by `tokio-postgres`
#[derive(Debug, Clone, Default)]
pub struct PostgresExecutor {
    cancel: CancellationToken,
}

impl PostgresExecutor {
    /// Create an executor whose calls abort once `cancel` fires
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Run a driver call, failing with [`OperatorError::Cancelled`] on shutdown
    async fn cancellable<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(OperatorError::Cancelled(operation.to_string())),
            result = fut => result,
        }
    }

    async fn connect(
        &self,
        target: &ServerTarget,
        admin: &AdminCredentials,
        dbname: &str,
    ) -> Result<Session> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&target.host)
            .port(target.port)
            .user(&admin.user)
            .password(admin.password.expose_secret())
            .dbname(dbname)
            .application_name("orchestrdb-operator")
            .ssl_mode(driver_ssl_mode(target.ssl_mode));

        let tls = make_tls_connector(target.ssl_mode)?;

        debug!(server = %target, dbname = %dbname, ssl_mode = %target.ssl_mode, "Opening admin session");

        let (client, connection) = self
            .cancellable("connect", async {
                config
                    .connect(tls)
                    .await
                    .map_err(|e| OperatorError::transport(format!("connect to {}", target), e))
            })
            .await?;

        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Session { client, connection })
    }

    async fn execute(&self, session: &Session, operation: &str, sql: &str) -> Result<()> {
        self.cancellable(operation, async {
            session
                .client
                .batch_execute(sql)
                .await
                .map_err(|e| OperatorError::transport(operation, e))
        })
        .await
    }

    async fn role_exists(&self, session: &Session, username: &str) -> Result<bool> {
        self.cancellable("lookup role", async {
            session
                .client
                .query_opt("SELECT 1 FROM pg_roles WHERE rolname = $1", &[&username])
                .await
                .map(|row| row.is_some())
                .map_err(|e| OperatorError::transport("lookup role", e))
        })
        .await
    }

    async fn upsert_role(
        &self,
        session: &Session,
        username: &str,
        password: &SecretString,
    ) -> Result<()> {
        let role = quote_ident(username);
        let secret = quote_literal(password.expose_secret());

        if !self.role_exists(session, username).await? {
            let create = format!("CREATE ROLE {} WITH LOGIN PASSWORD {}", role, secret);
            let created = self
                .cancellable("create role", async {
                    match session.client.batch_execute(&create).await {
                        Ok(()) => Ok(true),
                        // Lost a create race against another writer
                        Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => Ok(false),
                        Err(e) => Err(OperatorError::transport("create role", e)),
                    }
                })
                .await?;

            if created {
                info!(role = %username, "Created role");
                return Ok(());
            }
        }

        let alter = format!("ALTER ROLE {} WITH LOGIN PASSWORD {}", role, secret);
        self.execute(session, "alter role", &alter).await?;
        debug!(role = %username, "Updated role password");
        Ok(())
    }

    /// Upsert the role and apply grants, opening database sessions on demand
    ///
    /// `sessions` holds the admin session under [`BOOTSTRAP_DATABASE`]; the
    /// caller closes everything left in it.
    async fn ensure_user_in(
        &self,
        sessions: &mut HashMap<String, Session>,
        target: &ServerTarget,
        admin: &AdminCredentials,
        username: &str,
        password: &SecretString,
        grants: &[AccessGrant],
    ) -> Result<()> {
        let admin_session = sessions.get(BOOTSTRAP_DATABASE).ok_or_else(|| {
            OperatorError::Transport {
                operation: "ensure user".to_string(),
                message: "admin session is not open".to_string(),
            }
        })?;
        self.upsert_role(admin_session, username, password).await?;

        for statement in plan_all(username, grants) {
            let db_name = match &statement.session {
                GrantSession::Admin => BOOTSTRAP_DATABASE.to_string(),
                GrantSession::Database(db_name) => db_name.clone(),
            };
            if !sessions.contains_key(&db_name) {
                let session = self.connect(target, admin, &db_name).await?;
                sessions.insert(db_name.clone(), session);
            }
            if let Some(session) = sessions.get(&db_name) {
                self.execute(session, "grant", &statement.sql).await?;
            }
        }

        if !grants.is_empty() {
            debug!(role = %username, grants = grants.len(), "Applied access grants");
        }
        Ok(())
    }
}

#[async_trait]
impl AdminExecutor for PostgresExecutor {
    async fn create_database(
        &self,
        target: &ServerTarget,
        admin: &AdminCredentials,
        name: &str,
    ) -> Result<bool> {
        let session = self.connect(target, admin, BOOTSTRAP_DATABASE).await?;
        let sql = format!("CREATE DATABASE {}", quote_ident(name));

        let result = self
            .cancellable("create database", async {
                match session.client.batch_execute(&sql).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.code() == Some(&SqlState::DUPLICATE_DATABASE) => Ok(false),
                    Err(e) => Err(OperatorError::transport("create database", e)),
                }
            })
            .await;

        session.close().await;

        let created = result?;
        if created {
            info!(database = %name, server = %target, "Created database");
        } else {
            debug!(database = %name, server = %target, "Database already exists");
        }
        Ok(created)
    }

    async fn ensure_user(
        &self,
        target: &ServerTarget,
        admin: &AdminCredentials,
        username: &str,
        password: &SecretString,
        grants: &[AccessGrant],
    ) -> Result<()> {
        let admin_session = self.connect(target, admin, BOOTSTRAP_DATABASE).await?;
        let mut sessions: HashMap<String, Session> = HashMap::new();
        sessions.insert(BOOTSTRAP_DATABASE.to_string(), admin_session);

        let result = self
            .ensure_user_in(&mut sessions, target, admin, username, password, grants)
            .await;

        for (_, session) in sessions.drain() {
            session.close().await;
        }

        result
    }
}
