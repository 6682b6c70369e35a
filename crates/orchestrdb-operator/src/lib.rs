//! # orchestrdb Kubernetes Operator
//!
//! Kubernetes operator that provisions PostgreSQL databases and login roles
//! declaratively.
//!
//! ## Features
//!
//! - **Custom Resource Definitions**: `Database` and `User` CRDs in the
//!   `orchestrdb.mertsaygi.net` group
//! - **Admin credentials**: inline for development, or from a referenced
//!   Secret that always takes precedence
//! - **Generated credentials**: each `User` gets a random password written to
//!   a Secret the operator creates once and never overwrites
//! - **Access rules**: readonly, readwrite and owner grants per database
//! - **Leader election**: optional `coordination.k8s.io` Lease so only one
//!   replica reconciles
//! - **Observability**: Prometheus-compatible operator metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use orchestrdb_operator::prelude::*;
//! use kube::Client;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     let registry = ResourceRegistry::with_builtin_kinds();
//!
//!     run_operator(client, OperatorConfig::default(), &registry, CancellationToken::new()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! Every pass follows the same steps:
//!
//! 1. **Gate**: re-fetch the object and skip it when it is gone, being
//!    deleted, or already settled for its generation
//! 2. **Resolve**: look up admin credentials
//! 3. **Converge**: create the database, or write the generated secret,
//!    upsert the role and apply grants
//! 4. **Report**: write `created`, `lastError` and `updatedAt` to status once
//!
//! Failed passes are retried after 30 seconds. Successes and conflicts wait
//! for the next spec change.
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`registry`] - Kinds served by the operator, CRD printing and install
//! - [`credentials`] - Admin credential resolution
//! - [`access`] - Access rule parsing and grant planning
//! - [`postgres`] - Administrative PostgreSQL executor
//! - [`database`] / [`user`] - Convergence engines
//! - [`status`] - Pass outcomes and status records
//! - [`controller`], [`database_controller`], [`user_controller`] - Controllers
//! - [`leader`] - Lease-based leader election across replicas
//! - [`error`] - Error types for operator operations
//!
//! ## Metrics
//!
//! - `orchestrdb_operator_reconciliations_total{kind}` - Reconciliation attempts
//! - `orchestrdb_operator_reconciliation_errors_total{kind}` - Errors handed to the error policy
//! - `orchestrdb_operator_reconciliation_duration_seconds{kind}` - Reconciliation latency
//! - `orchestrdb_operator_outcomes_total{kind,outcome}` - Recorded pass outcomes

pub mod access;
pub mod config;
pub mod controller;
pub mod crd;
pub mod credentials;
pub mod database;
pub mod database_controller;
pub mod error;
pub mod leader;
pub mod password;
pub mod postgres;
pub mod registry;
pub mod status;
pub mod store;
pub mod tls;
pub mod user;
pub mod user_controller;

#[cfg(test)]
mod test_support;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::access::{AccessGrant, AccessRole, AccessScope};
    pub use crate::config::OperatorConfig;
    pub use crate::controller::{run_operator, ControllerContext, ControllerMetrics};
    pub use crate::crd::{
        AccessRule, Database, DatabaseSpec, GeneratedSecretRef, OutcomeReason, ProvisionStatus,
        SecretRef, SslMode, User, UserSpec,
    };
    pub use crate::credentials::{AdminCredentials, CredentialResolver};
    pub use crate::database::DatabaseEngine;
    pub use crate::database_controller::{reconcile_database, DatabaseContext};
    pub use crate::error::{OperatorError, Result};
    pub use crate::leader::{LeaderElectionConfig, LeaderElector};
    pub use crate::password::PasswordGenerator;
    pub use crate::postgres::{AdminExecutor, PostgresExecutor, ServerTarget};
    pub use crate::registry::ResourceRegistry;
    pub use crate::status::ReconcileOutcome;
    pub use crate::store::{KubeStore, LeaseStore, ResourceStore, SecretStore};
    pub use crate::user::UserEngine;
    pub use crate::user_controller::{reconcile_user, UserContext};
}
