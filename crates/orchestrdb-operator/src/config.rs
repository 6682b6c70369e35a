//! Runtime configuration shared by the controllers

use crate::error::RETRY_DELAY;
use crate::password::DEFAULT_PASSWORD_LENGTH;
use std::time::Duration;

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "orchestrdb-operator";

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch, `None` for the whole cluster
    pub namespace: Option<String>,
    /// Length of generated user passwords
    pub password_length: usize,
    /// Delay before a failed pass is retried
    pub retry_delay: Duration,
    pub field_manager: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            password_length: DEFAULT_PASSWORD_LENGTH,
            retry_delay: RETRY_DELAY,
            field_manager: FIELD_MANAGER.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Set the watched namespace; an empty string means all namespaces
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = if namespace.is_empty() {
            None
        } else {
            Some(namespace)
        };
        self
    }

    pub fn with_password_length(mut self, length: usize) -> Self {
        self.password_length = length;
        self
    }
}
