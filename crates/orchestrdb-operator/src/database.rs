//! Database convergence

use crate::credentials::AdminCredentials;
use crate::error::Result;
use crate::postgres::{AdminExecutor, ServerTarget};
use std::sync::Arc;
use tracing::instrument;

/// Result of converging one database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseConvergence {
    /// Whether this pass created the database
    pub created: bool,
}

/// Ensures databases exist on a target server
#[derive(Clone)]
pub struct DatabaseEngine {
    executor: Arc<dyn AdminExecutor>,
}

impl DatabaseEngine {
    pub fn new(executor: Arc<dyn AdminExecutor>) -> Self {
        Self { executor }
    }

    /// Make sure database `name` exists; an existing one is success
    #[instrument(skip_all, fields(server = %target, database = %name))]
    pub async fn ensure_database(
        &self,
        target: &ServerTarget,
        admin: &AdminCredentials,
        name: &str,
    ) -> Result<DatabaseConvergence> {
        let created = self.executor.create_database(target, admin, name).await?;
        Ok(DatabaseConvergence { created })
    }
}
