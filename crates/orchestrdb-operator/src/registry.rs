//! Registry of the custom resource kinds served by this operator
//!
//! The registry is built once at startup and handed to everything that needs
//! to know which kinds exist: CRD printing, CRD installation and controller
//! start-up. There is no process-wide registration state.

use crate::crd::{Database, User};
use crate::error::{OperatorError, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tracing::info;

/// A kind registered with the operator
#[derive(Debug, Clone)]
pub struct RegisteredKind {
    /// Kind name, e.g. `Database`
    pub kind: String,
    /// Full CRD name, e.g. `databases.orchestrdb.mertsaygi.net`
    pub crd_name: String,
    /// Generated CustomResourceDefinition
    pub crd: CustomResourceDefinition,
}

/// Explicit set of resource kinds known to the operator
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    kinds: Vec<RegisteredKind>,
}

impl ResourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every kind this operator reconciles
    pub fn with_builtin_kinds() -> Self {
        Self::new().register::<Database>().register::<User>()
    }

    /// Register a custom resource kind; registering twice is a no-op
    pub fn register<K: CustomResourceExt>(mut self) -> Self {
        let kind = K::api_resource().kind;
        if !self.is_registered(&kind) {
            self.kinds.push(RegisteredKind {
                kind,
                crd_name: K::crd_name().to_string(),
                crd: K::crd(),
            });
        }
        self
    }

    /// Whether a kind has been registered
    pub fn is_registered(&self, kind: &str) -> bool {
        self.kinds.iter().any(|k| k.kind == kind)
    }

    /// Registered kinds in registration order
    pub fn kinds(&self) -> &[RegisteredKind] {
        &self.kinds
    }

    /// Render every registered CRD as a multi-document YAML stream
    pub fn crds_yaml(&self) -> Result<String> {
        let mut out = String::new();
        for registered in &self.kinds {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(&registered.crd)?);
        }
        Ok(out)
    }

    /// Install or update every registered CRD using server-side apply
    pub async fn install(&self, client: &Client, field_manager: &str) -> Result<()> {
        let api: Api<CustomResourceDefinition> = Api::all(client.clone());
        let params = PatchParams::apply(field_manager).force();

        for registered in &self.kinds {
            info!(crd = %registered.crd_name, "Applying CustomResourceDefinition");
            api.patch(&registered.crd_name, &params, &Patch::Apply(&registered.crd))
                .await
                .map_err(OperatorError::from)?;
        }
        Ok(())
    }
}
