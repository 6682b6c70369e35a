//! Database Controller
//!
//! Watches `Database` resources and makes sure each named database exists on
//! its target server. Databases are never dropped.

use crate::config::OperatorConfig;
use crate::controller::{
    begin_pass, error_policy, finish_pass, ControllerContext, ControllerMetrics, PassStart,
};
use crate::credentials::CredentialResolver;
use crate::crd::{validation_message, Database};
use crate::database::DatabaseEngine;
use crate::error::Result;
use crate::postgres::{AdminExecutor, PostgresExecutor, ServerTarget};
use crate::status::ReconcileOutcome;
use crate::store::{KubeStore, ResourceStore, SecretStore};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use validator::Validate;

/// Context for the Database controller
pub type DatabaseContext = ControllerContext<Database, DatabaseEngine>;

/// Start the Database controller
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let databases: Api<Database> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let store = Arc::new(KubeStore::new(client.clone(), config.field_manager.clone()));
    let resources: Arc<dyn ResourceStore<Database>> = store.clone();
    let secrets: Arc<dyn SecretStore> = store;
    let executor: Arc<dyn AdminExecutor> = Arc::new(PostgresExecutor::new(cancel.clone()));

    info!(
        namespace = config.namespace.as_deref().unwrap_or("all"),
        "Starting Database controller"
    );

    let ctx = Arc::new(
        DatabaseContext::new(
            resources,
            CredentialResolver::new(secrets),
            DatabaseEngine::new(executor),
            config,
        )
        .with_metrics(ControllerMetrics::new("Database")),
    );

    Controller::new(databases, Config::default())
        .graceful_shutdown_on(cancel.cancelled_owned())
        .run(reconcile_database, error_policy::<Database, DatabaseEngine>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Reconcile one Database
#[instrument(skip(database, ctx), fields(name = %database.name_any(), namespace = database.namespace()))]
pub async fn reconcile_database(
    database: Arc<Database>,
    ctx: Arc<DatabaseContext>,
) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = match begin_pass(database.as_ref(), &ctx).await {
        Ok(PassStart::Proceed(current)) => {
            let outcome = converge(&current, &ctx).await;
            finish_pass(&current, &ctx, outcome).await
        }
        Ok(PassStart::Done(action)) => Ok(action),
        Err(e) => Err(e),
    };

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    result
}

/// Resolve credentials and ensure the database exists
async fn converge(database: &Database, ctx: &DatabaseContext) -> ReconcileOutcome {
    if let Err(errors) = database.spec.validate() {
        return ReconcileOutcome::ConvergenceError(validation_message(&errors));
    }

    let namespace = database.namespace().unwrap_or_else(|| "default".to_string());
    let admin = match ctx.credentials.resolve(&database.spec, &namespace).await {
        Ok(admin) => admin,
        Err(e) => return ReconcileOutcome::credential(&e),
    };

    let target = match ServerTarget::from_spec(&database.spec) {
        Ok(target) => target,
        Err(e) => return ReconcileOutcome::convergence(&e),
    };

    match ctx
        .engine
        .ensure_database(&target, &admin, &database.spec.name)
        .await
    {
        Ok(_) => ReconcileOutcome::Succeeded,
        Err(e) => ReconcileOutcome::convergence(&e),
    }
}
