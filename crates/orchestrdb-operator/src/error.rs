//! Error types for the orchestrdb operator

use std::time::Duration;
use thiserror::Error;

/// Fixed delay before a failed pass is attempted again
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Referenced secret does not exist
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    /// Referenced secret exists but lacks a required key
    #[error("key '{key}' not found in secret {namespace}/{name}")]
    KeyMissing {
        key: String,
        namespace: String,
        name: String,
    },

    /// Required field missing or malformed
    #[error("{0}")]
    ValidationError(String),

    /// Access rule carries a role or scope outside the supported set
    #[error("unsupported {field} '{value}'")]
    UnsupportedValue { field: &'static str, value: String },

    /// Operator configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Destination already holds state the operator refuses to overwrite
    #[error("{0}")]
    Conflict(String),

    /// Create-only write lost against an existing object
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    /// Administrative connection or statement failed
    #[error("{operation}: {message}")]
    Transport { operation: String, message: String },

    /// TLS setup for the administrative connection failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Administrative call aborted by shutdown
    #[error("{0} cancelled")]
    Cancelled(String),

    /// The system random source failed
    #[error("random source unavailable")]
    RandomSource(#[from] ring::error::Unspecified),

    /// Another replica took over the leader lease
    #[error("leadership lost: {0}")]
    LeadershipLost(String),

    /// Persisting the pass outcome failed
    #[error("status update failed: {0}")]
    StatusWrite(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Build a transport error from a database driver failure
    pub fn transport(operation: impl Into<String>, err: tokio_postgres::Error) -> Self {
        let message = match err.as_db_error() {
            Some(db) => format!("{} (SQLSTATE {})", db.message(), db.code().code()),
            None => err.to_string(),
        };
        OperatorError::Transport {
            operation: operation.into(),
            message,
        }
    }

    /// Whether this error represents a conflict with existing state
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            OperatorError::Conflict(_) | OperatorError::AlreadyExists { .. }
        )
    }

    /// Check if this error is retryable
    ///
    /// Conflicts wait for the next external change instead of a timer.
    /// Validation failures are retried like transient ones.
    pub fn is_retryable(&self) -> bool {
        !self.is_conflict()
    }

    /// Get a suggested requeue delay for retryable errors
    ///
    /// Errors raised by the API server itself, including failed status
    /// writes, have no fixed delay and fall back to exponential backoff.
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            OperatorError::StatusWrite(_) | OperatorError::KubeError(_) => None,
            _ if self.is_retryable() => Some(RETRY_DELAY),
            _ => None,
        }
    }
}
