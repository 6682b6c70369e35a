//! PostgresExecutor against a real PostgreSQL server
//!
//! Run with `cargo test -- --ignored` on a machine with Docker.

use anyhow::Result;
use orchestrdb_operator::access::{validate_rules, AccessGrant};
use orchestrdb_operator::credentials::AdminCredentials;
use orchestrdb_operator::crd::{AccessRule, SslMode};
use orchestrdb_operator::error::OperatorError;
use orchestrdb_operator::postgres::{AdminExecutor, PostgresExecutor, ServerTarget};
use secrecy::SecretString;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;

const ADMIN_USER: &str = "admin";
const ADMIN_PASSWORD: &str = "adminpass";

struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    target: ServerTarget,
}

impl TestPostgres {
    async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_env_var("POSTGRES_DB", "postgres")
            .with_env_var("POSTGRES_USER", ADMIN_USER)
            .with_env_var("POSTGRES_PASSWORD", ADMIN_PASSWORD)
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;

        Ok(Self {
            _container: container,
            target: ServerTarget {
                host,
                port,
                ssl_mode: SslMode::Disable,
            },
        })
    }

    fn admin(&self) -> AdminCredentials {
        AdminCredentials::new(ADMIN_USER, ADMIN_PASSWORD)
    }

    /// Open a plain session as `user` on `dbname`
    async fn connect_as(
        &self,
        user: &str,
        password: &str,
        dbname: &str,
    ) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
        let (client, connection) = tokio_postgres::Config::new()
            .host(&self.target.host)
            .port(self.target.port)
            .user(user)
            .password(password)
            .dbname(dbname)
            .connect(NoTls)
            .await?;
        tokio::spawn(connection);
        Ok(client)
    }
}

fn grants(rules: &[(&str, &str)]) -> Vec<AccessGrant> {
    let rules: Vec<AccessRule> = rules
        .iter()
        .map(|(db, role)| AccessRule {
            db_name: Some(db.to_string()),
            role: Some(role.to_string()),
            scope: None,
        })
        .collect();
    validate_rules(&rules).unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_create_database_is_idempotent() -> Result<()> {
    let pg = TestPostgres::start().await?;
    let executor = PostgresExecutor::new(CancellationToken::new());

    assert!(executor.create_database(&pg.target, &pg.admin(), "orders").await?);
    assert!(!executor.create_database(&pg.target, &pg.admin(), "orders").await?);

    let client = pg.connect_as(ADMIN_USER, ADMIN_PASSWORD, "orders").await?;
    let row = client.query_one("SELECT current_database()", &[]).await?;
    assert_eq!(row.get::<_, String>(0), "orders");
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_create_database_quotes_identifier() -> Result<()> {
    let pg = TestPostgres::start().await?;
    let executor = PostgresExecutor::new(CancellationToken::new());

    executor
        .create_database(&pg.target, &pg.admin(), "Mixed-Case")
        .await?;

    let client = pg.connect_as(ADMIN_USER, ADMIN_PASSWORD, "postgres").await?;
    let row = client
        .query_opt("SELECT 1 FROM pg_database WHERE datname = 'Mixed-Case'", &[])
        .await?;
    assert!(row.is_some());
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_ensure_user_creates_role_and_grants() -> Result<()> {
    let pg = TestPostgres::start().await?;
    let executor = PostgresExecutor::new(CancellationToken::new());
    executor.create_database(&pg.target, &pg.admin(), "orders").await?;

    let setup = pg.connect_as(ADMIN_USER, ADMIN_PASSWORD, "orders").await?;
    setup
        .batch_execute("CREATE TABLE items (id int); INSERT INTO items VALUES (1)")
        .await?;

    let password = SecretString::from("it's-a-secret".to_string());
    executor
        .ensure_user(
            &pg.target,
            &pg.admin(),
            "alice",
            &password,
            &grants(&[("orders", "readonly")]),
        )
        .await?;

    let alice = pg.connect_as("alice", "it's-a-secret", "orders").await?;
    let row = alice.query_one("SELECT count(*) FROM items", &[]).await?;
    assert_eq!(row.get::<_, i64>(0), 1);
    assert!(alice.batch_execute("INSERT INTO items VALUES (2)").await.is_err());
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_ensure_user_updates_existing_role() -> Result<()> {
    let pg = TestPostgres::start().await?;
    let executor = PostgresExecutor::new(CancellationToken::new());

    let first = SecretString::from("first-password".to_string());
    let second = SecretString::from("second-password".to_string());
    executor
        .ensure_user(&pg.target, &pg.admin(), "bob", &first, &[])
        .await?;
    executor
        .ensure_user(&pg.target, &pg.admin(), "bob", &second, &grants(&[("postgres", "readwrite")]))
        .await?;

    assert!(pg.connect_as("bob", "first-password", "postgres").await.is_err());
    assert!(pg.connect_as("bob", "second-password", "postgres").await.is_ok());
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_wrong_admin_password_is_transport_error() -> Result<()> {
    let pg = TestPostgres::start().await?;
    let executor = PostgresExecutor::new(CancellationToken::new());

    let err = executor
        .create_database(&pg.target, &AdminCredentials::new(ADMIN_USER, "nope"), "orders")
        .await
        .unwrap_err();
    assert!(matches!(err, OperatorError::Transport { .. }));
    Ok(())
}
