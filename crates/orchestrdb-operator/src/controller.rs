//! Shared controller plumbing
//!
//! Both controllers follow the same pass shape: re-fetch the object, skip it
//! when it is gone, being deleted or already settled, run the kind-specific
//! stages, then write the outcome to status exactly once. This module holds
//! the parts that do not depend on the kind.

use crate::config::OperatorConfig;
use crate::credentials::CredentialResolver;
use crate::crd::ProvisionedResource;
use crate::database_controller;
use crate::error::{OperatorError, Result};
use crate::registry::ResourceRegistry;
use crate::status::{plan_pass, PassDecision, ReconcileOutcome};
use crate::store::ResourceStore;
use crate::user_controller;
use chrono::Utc;
use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Base delay for status-write backoff
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum delay for status-write backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Metrics for one controller kind
#[derive(Clone)]
pub struct ControllerMetrics {
    kind: &'static str,
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create metrics labelled with `kind`
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            reconciliations: metrics::counter!("orchestrdb_operator_reconciliations_total", "kind" => kind),
            errors: metrics::counter!("orchestrdb_operator_reconciliation_errors_total", "kind" => kind),
            duration: metrics::histogram!("orchestrdb_operator_reconciliation_duration_seconds", "kind" => kind),
        }
    }

    /// Count a recorded pass outcome
    pub fn record_outcome(&self, outcome: &ReconcileOutcome) {
        metrics::counter!(
            "orchestrdb_operator_outcomes_total",
            "kind" => self.kind,
            "outcome" => outcome.label()
        )
        .increment(1);
    }
}

/// Context passed to a controller
pub struct ControllerContext<K, E> {
    /// Access to the reconciled objects and their status
    pub resources: Arc<dyn ResourceStore<K>>,
    /// Admin credential resolution
    pub credentials: CredentialResolver,
    /// Kind-specific convergence engine
    pub engine: E,
    pub config: OperatorConfig,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-object error counts for exponential backoff
    pub error_counts: DashMap<String, u32>,
}

impl<K, E> ControllerContext<K, E> {
    pub fn new(
        resources: Arc<dyn ResourceStore<K>>,
        credentials: CredentialResolver,
        engine: E,
        config: OperatorConfig,
    ) -> Self {
        Self {
            resources,
            credentials,
            engine,
            config,
            metrics: None,
            error_counts: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Key used for per-object bookkeeping
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_else(|| "default".to_string()),
        obj.name_any()
    )
}

/// First step of a pass
pub enum PassStart<K> {
    /// Reconcile this freshly fetched object
    Proceed(K),
    /// Nothing to do this time
    Done(Action),
}

/// Re-fetch the object and decide whether a pass is due
pub async fn begin_pass<K, E>(obj: &K, ctx: &ControllerContext<K, E>) -> Result<PassStart<K>>
where
    K: Resource + ProvisionedResource,
{
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();

    let Some(current) = ctx.resources.get(&namespace, &name).await? else {
        debug!(name = %name, namespace = %namespace, "Object no longer exists");
        ctx.error_counts.remove(&object_key(obj));
        return Ok(PassStart::Done(Action::await_change()));
    };

    if current.meta().deletion_timestamp.is_some() {
        debug!(name = %name, namespace = %namespace, "Object is being deleted");
        ctx.error_counts.remove(&object_key(obj));
        return Ok(PassStart::Done(Action::await_change()));
    }

    match plan_pass(
        current.meta().generation,
        current.provision_status(),
        Utc::now(),
        ctx.config.retry_delay,
    ) {
        PassDecision::Run => Ok(PassStart::Proceed(current)),
        PassDecision::Skip(action) => {
            debug!(name = %name, namespace = %namespace, ?action, "Pass not due");
            Ok(PassStart::Done(action))
        }
    }
}

/// Persist the outcome of a pass and pick the next action
///
/// A failed status write is returned as [`OperatorError::StatusWrite`] so the
/// error policy backs off.
pub async fn finish_pass<K, E>(
    obj: &K,
    ctx: &ControllerContext<K, E>,
    outcome: ReconcileOutcome,
) -> Result<Action>
where
    K: Resource + ProvisionedResource,
{
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();

    let status = outcome.to_status(obj.provision_status(), obj.meta().generation, Utc::now());
    ctx.resources
        .update_status(&namespace, &name, &status)
        .await
        .map_err(|e| OperatorError::StatusWrite(e.to_string()))?;

    if let Some(ref metrics) = ctx.metrics {
        metrics.record_outcome(&outcome);
    }
    ctx.error_counts.remove(&object_key(obj));

    match &outcome {
        ReconcileOutcome::Succeeded => info!(name = %name, namespace = %namespace, "Pass succeeded"),
        other => warn!(
            name = %name,
            namespace = %namespace,
            reason = ?other.reason(),
            error = %other.message(),
            "Pass failed"
        ),
    }

    Ok(outcome.next_action(ctx.config.retry_delay))
}

/// Error policy for the controllers: exponential backoff
pub fn error_policy<K, E>(obj: Arc<K>, error: &OperatorError, ctx: Arc<ControllerContext<K, E>>) -> Action
where
    K: ResourceExt,
{
    let key = object_key(obj.as_ref());
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    if let Some(ref metrics) = ctx.metrics {
        metrics.errors.increment(1);
    }

    let delay = error
        .requeue_delay()
        .unwrap_or_else(|| backoff_delay(retries));

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

/// 30s → 60s → 120s → 240s → 480s → 600s (capped)
fn backoff_delay(retries: u32) -> Duration {
    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
    backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
}

/// Run a controller for every registered kind until `cancel` fires
pub async fn run_operator(
    client: Client,
    config: OperatorConfig,
    registry: &ResourceRegistry,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        namespace = config.namespace.as_deref().unwrap_or("all"),
        kinds = registry.kinds().len(),
        "Starting controllers"
    );

    let databases = async {
        if registry.is_registered("Database") {
            database_controller::run_controller(client.clone(), config.clone(), cancel.clone())
                .await
        } else {
            Ok(())
        }
    };
    let users = async {
        if registry.is_registered("User") {
            user_controller::run_controller(client.clone(), config.clone(), cancel.clone()).await
        } else {
            Ok(())
        }
    };

    let (databases, users) = futures::join!(databases, users);
    databases?;
    users?;

    info!("Controllers stopped");
    Ok(())
}
