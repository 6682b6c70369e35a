//! Pass outcomes and status reporting
//!
//! Every pass ends in exactly one [`ReconcileOutcome`]. That single value
//! decides both the persisted [`ProvisionStatus`] and the next controller
//! [`Action`], so the two can never disagree.

use crate::crd::{OutcomeReason, ProvisionStatus};
use crate::error::OperatorError;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use kube::runtime::controller::Action;
use std::time::Duration;

/// Outcome of one reconcile pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Succeeded,
    CredentialError(String),
    ConvergenceError(String),
    ConflictError(String),
}

impl ReconcileOutcome {
    /// Outcome for a failure while resolving admin credentials
    pub fn credential(err: &OperatorError) -> Self {
        ReconcileOutcome::CredentialError(err.to_string())
    }

    /// Outcome for a failure while converging server state
    pub fn convergence(err: &OperatorError) -> Self {
        if err.is_conflict() {
            ReconcileOutcome::ConflictError(err.to_string())
        } else {
            ReconcileOutcome::ConvergenceError(err.to_string())
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ReconcileOutcome::Succeeded)
    }

    pub fn reason(&self) -> OutcomeReason {
        match self {
            ReconcileOutcome::Succeeded => OutcomeReason::Succeeded,
            ReconcileOutcome::CredentialError(_) => OutcomeReason::CredentialError,
            ReconcileOutcome::ConvergenceError(_) => OutcomeReason::ConvergenceError,
            ReconcileOutcome::ConflictError(_) => OutcomeReason::ConflictError,
        }
    }

    /// Error text recorded in `lastError`, empty on success
    pub fn message(&self) -> &str {
        match self {
            ReconcileOutcome::Succeeded => "",
            ReconcileOutcome::CredentialError(m)
            | ReconcileOutcome::ConvergenceError(m)
            | ReconcileOutcome::ConflictError(m) => m,
        }
    }

    /// Label value for the outcome metric
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Succeeded => "succeeded",
            ReconcileOutcome::CredentialError(_) => "credential_error",
            ReconcileOutcome::ConvergenceError(_) => "convergence_error",
            ReconcileOutcome::ConflictError(_) => "conflict_error",
        }
    }

    /// Status to persist for this outcome
    pub fn to_status(
        &self,
        previous: Option<&ProvisionStatus>,
        generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> ProvisionStatus {
        ProvisionStatus {
            created: self.is_success(),
            last_error: self.message().to_string(),
            updated_at: next_timestamp(previous.map(|s| s.updated_at.as_str()), now),
            reason: Some(self.reason()),
            observed_generation: generation,
        }
    }

    /// What the controller does after this outcome
    ///
    /// Success and conflicts wait for the next change; everything else is
    /// retried after `retry_delay`.
    pub fn next_action(&self, retry_delay: Duration) -> Action {
        match self {
            ReconcileOutcome::Succeeded | ReconcileOutcome::ConflictError(_) => {
                Action::await_change()
            }
            ReconcileOutcome::CredentialError(_) | ReconcileOutcome::ConvergenceError(_) => {
                Action::requeue(retry_delay)
            }
        }
    }
}

/// Timestamp for a new status, strictly after `previous`
///
/// Timestamps carry microseconds. When the clock has not advanced past the
/// previous value it is bumped by one microsecond.
pub fn next_timestamp(previous: Option<&str>, now: DateTime<Utc>) -> String {
    let previous = previous
        .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
        .map(|p| p.with_timezone(&Utc));

    let now = truncate_micros(now);
    let stamp = match previous {
        Some(prev) if now <= prev => truncate_micros(prev) + ChronoDuration::microseconds(1),
        _ => now,
    };
    stamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn truncate_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(t.timestamp_micros()).unwrap_or(t)
}

/// Whether a pass should run for the observed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassDecision {
    Run,
    Skip(Action),
}

/// Decide whether a pass is due
///
/// A status recorded for the current generation is final when it is a
/// success or conflict. A recorded failure is only retried once the retry
/// delay has elapsed since it was written. Objects without a generation are
/// always reconciled.
pub fn plan_pass(
    generation: Option<i64>,
    status: Option<&ProvisionStatus>,
    now: DateTime<Utc>,
    retry_delay: Duration,
) -> PassDecision {
    let (Some(generation), Some(status)) = (generation, status) else {
        return PassDecision::Run;
    };
    if status.observed_generation != Some(generation) {
        return PassDecision::Run;
    }

    match status.reason {
        Some(OutcomeReason::Succeeded) | Some(OutcomeReason::ConflictError) => {
            PassDecision::Skip(Action::await_change())
        }
        Some(OutcomeReason::CredentialError) | Some(OutcomeReason::ConvergenceError) => {
            let Ok(updated) = DateTime::parse_from_rfc3339(&status.updated_at) else {
                return PassDecision::Run;
            };
            let elapsed = now
                .signed_duration_since(updated.with_timezone(&Utc))
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < retry_delay {
                PassDecision::Skip(Action::requeue(retry_delay - elapsed))
            } else {
                PassDecision::Run
            }
        }
        None => PassDecision::Run,
    }
}
