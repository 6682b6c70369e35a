//! User Controller
//!
//! Watches `User` resources. A pass refuses to run when the destination
//! secret already exists, so generated credentials are written exactly once.
//! Roles are never dropped and grants are never revoked.

use crate::config::OperatorConfig;
use crate::controller::{
    begin_pass, error_policy, finish_pass, ControllerContext, ControllerMetrics, PassStart,
};
use crate::credentials::CredentialResolver;
use crate::crd::{validation_message, User};
use crate::error::Result;
use crate::password::PasswordGenerator;
use crate::postgres::{AdminExecutor, PostgresExecutor, ServerTarget};
use crate::status::ReconcileOutcome;
use crate::store::{KubeStore, ResourceStore, SecretStore};
use crate::user::UserEngine;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use validator::Validate;

/// Context for the User controller
pub type UserContext = ControllerContext<User, UserEngine>;

/// Start the User controller
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let users: Api<User> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let passwords = Arc::new(PasswordGenerator::new(config.password_length)?);
    let store = Arc::new(KubeStore::new(client.clone(), config.field_manager.clone()));
    let resources: Arc<dyn ResourceStore<User>> = store.clone();
    let secrets: Arc<dyn SecretStore> = store;
    let executor: Arc<dyn AdminExecutor> = Arc::new(PostgresExecutor::new(cancel.clone()));

    info!(
        namespace = config.namespace.as_deref().unwrap_or("all"),
        password_length = config.password_length,
        "Starting User controller"
    );

    let ctx = Arc::new(
        UserContext::new(
            resources,
            CredentialResolver::new(secrets.clone()),
            UserEngine::new(executor, secrets, passwords),
            config,
        )
        .with_metrics(ControllerMetrics::new("User")),
    );

    Controller::new(users, Config::default())
        .graceful_shutdown_on(cancel.cancelled_owned())
        .run(reconcile_user, error_policy::<User, UserEngine>, ctx)
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

/// Reconcile one User
#[instrument(skip(user, ctx), fields(name = %user.name_any(), namespace = user.namespace()))]
pub async fn reconcile_user(user: Arc<User>, ctx: Arc<UserContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = match begin_pass(user.as_ref(), &ctx).await {
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

/// Guard the destination secret, resolve credentials and converge the role
async fn converge(user: &User, ctx: &UserContext) -> ReconcileOutcome {
    if let Err(errors) = user.spec.validate() {
        return ReconcileOutcome::ConvergenceError(validation_message(&errors));
    }

    let namespace = user.namespace().unwrap_or_else(|| "default".to_string());

    if let Err(e) = ctx
        .engine
        .check_generated_secret(&namespace, &user.spec.generated_secret_ref)
        .await
    {
        // A conflict here waits for the next change; lookup failures retry
        return ReconcileOutcome::convergence(&e);
    }

    let admin = match ctx.credentials.resolve(&user.spec, &namespace).await {
        Ok(admin) => admin,
        Err(e) => return ReconcileOutcome::credential(&e),
    };

    let target = match ServerTarget::from_spec(&user.spec) {
        Ok(target) => target,
        Err(e) => return ReconcileOutcome::convergence(&e),
    };

    match ctx.engine.ensure_user(user, &target, &admin).await {
        Ok(()) => ReconcileOutcome::Succeeded,
        Err(e) => ReconcileOutcome::convergence(&e),
    }
}

