//! Custom Resource Definitions for the orchestrdb operator
//!
//! This module defines the `Database` and `User` CRDs. Both describe a target
//! PostgreSQL server plus the administrative credentials used to converge it,
//! and share the [`ProvisionStatus`] record the operator writes back.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group for all orchestrdb resources
pub const API_GROUP: &str = "orchestrdb.mertsaygi.net";

/// Default key holding the username inside a referenced secret
pub const DEFAULT_USER_KEY: &str = "username";

/// Default key holding the password inside a referenced secret
pub const DEFAULT_PASSWORD_KEY: &str = "password";

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

/// Regex for validating namespaces (RFC 1123 label)
static LABEL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for validating secret data keys
static SECRET_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-._a-zA-Z0-9]+$").unwrap());

/// Validate a Kubernetes object name
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 253 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 253 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate the name of a referenced secret; empty means "no reference"
fn validate_optional_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    validate_k8s_name(value)
}

/// Validate an optional namespace; empty means "same namespace"
fn validate_optional_namespace(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 63 || !LABEL_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_namespace")
            .with_message(format!("'{}' is not a valid namespace", value).into()));
    }
    Ok(())
}

/// Validate an optional secret data key; empty falls back to the default key
fn validate_optional_secret_key(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 253 || !SECRET_KEY_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_secret_key")
            .with_message(format!("'{}' is not a valid secret key", value).into()));
    }
    Ok(())
}

/// Validate a PostgreSQL identifier (database or role name)
///
/// Identifiers are always quoted when used, so any character except NUL is
/// accepted, but the server truncates past 63 bytes.
fn validate_pg_identifier(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || value.len() > 63 {
        return Err(ValidationError::new("invalid_identifier")
            .with_message("identifier must be 1-63 bytes".into()));
    }
    if value.contains('\0') {
        return Err(ValidationError::new("invalid_identifier")
            .with_message("identifier must not contain NUL bytes".into()));
    }
    Ok(())
}

/// SSL mode used for administrative connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Plain TCP connection
    #[default]
    Disable,
    /// Try TLS, fall back to plain TCP
    Prefer,
    /// Require TLS without certificate verification
    Require,
    /// Require TLS and verify the server certificate chain
    VerifyCa,
    /// Require TLS and verify the chain and hostname
    VerifyFull,
}

impl std::fmt::Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SslMode::Disable => write!(f, "disable"),
            SslMode::Prefer => write!(f, "prefer"),
            SslMode::Require => write!(f, "require"),
            SslMode::VerifyCa => write!(f, "verify-ca"),
            SslMode::VerifyFull => write!(f, "verify-full"),
        }
    }
}

/// Read-only pointer to externally managed credential material
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Name of the Secret; empty disables the reference
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub name: String,

    /// Namespace of the Secret (defaults to the resource's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_namespace"))]
    pub namespace: Option<String>,

    /// Key holding the username (default: "username")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_secret_key"))]
    pub user_key: Option<String>,

    /// Key holding the password (default: "password")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_secret_key"))]
    pub password_key: Option<String>,
}

impl SecretRef {
    /// Namespace the secret lives in, falling back to the owner's namespace
    pub fn effective_namespace<'a>(&'a self, owner_namespace: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => owner_namespace,
        }
    }

    /// Key holding the username
    pub fn user_key(&self) -> &str {
        match self.user_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => DEFAULT_USER_KEY,
        }
    }

    /// Key holding the password
    pub fn password_key(&self) -> &str {
        match self.password_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => DEFAULT_PASSWORD_KEY,
        }
    }
}

/// Destination of the credentials generated for a [`User`]
///
/// The Secret must not exist before the User is first reconciled.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedSecretRef {
    /// Name of the Secret the operator creates
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,

    /// Namespace of the Secret (defaults to the User's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_namespace"))]
    pub namespace: Option<String>,
}

impl GeneratedSecretRef {
    /// Namespace the secret is written to
    pub fn effective_namespace<'a>(&'a self, owner_namespace: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => owner_namespace,
        }
    }
}

/// Access granted to a user on one database
///
/// `role` and `scope` stay free-form here and are parsed by
/// [`crate::access::AccessGrant::from_rule`], so an unsupported value shows up
/// in the resource status instead of being rejected at admission.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessRule {
    /// Database on the target instance; may be empty for instance scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,

    /// readonly (default), readwrite or owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// database (default) or instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Connection and credential fields shared by every orchestrdb resource
pub trait AdminConnectionSpec {
    fn host(&self) -> &str;
    fn port(&self) -> i32;
    fn admin_user(&self) -> Option<&str>;
    fn admin_password(&self) -> Option<&str>;
    fn admin_secret_ref(&self) -> Option<&SecretRef>;
    /// SSL mode with the kind-specific default applied
    fn ssl_mode(&self) -> SslMode;
}

/// Database custom resource
///
/// Declares that a database must exist on a PostgreSQL server.
///
/// # Example
///
/// ```yaml
/// apiVersion: orchestrdb.mertsaygi.net/v1alpha1
/// kind: Database
/// metadata:
///   name: orders
/// spec:
///   host: postgres.data.svc
///   port: 5432
///   adminSecretRef:
///     name: pg-admin
///   name: orders
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "orchestrdb.mertsaygi.net",
    version = "v1alpha1",
    kind = "Database",
    plural = "databases",
    shortname = "pgdb",
    namespaced,
    status = "ProvisionStatus",
    printcolumn = r#"{"name":"Database","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Created","type":"boolean","jsonPath":".status.created"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".status.lastError","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Hostname or IP address of the PostgreSQL server
    #[validate(length(min = 1, max = 253, message = "host must be 1-253 characters"))]
    pub host: String,

    /// Port of the PostgreSQL server
    #[validate(range(min = 1, max = 65535, message = "port must be between 1 and 65535"))]
    pub port: i32,

    /// Admin user allowed to create databases (ignored when adminSecretRef is set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_user: Option<String>,

    /// Admin password, for development only; prefer adminSecretRef
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,

    /// Secret holding admin credentials; takes precedence over inline fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub admin_secret_ref: Option<SecretRef>,

    /// Name of the database to create
    #[validate(custom(function = "validate_pg_identifier"))]
    pub name: String,

    /// SSL mode for the admin connection (default: disable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_mode: Option<SslMode>,
}

impl AdminConnectionSpec for DatabaseSpec {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> i32 {
        self.port
    }

    fn admin_user(&self) -> Option<&str> {
        self.admin_user.as_deref()
    }

    fn admin_password(&self) -> Option<&str> {
        self.admin_password.as_deref()
    }

    fn admin_secret_ref(&self) -> Option<&SecretRef> {
        self.admin_secret_ref.as_ref()
    }

    fn ssl_mode(&self) -> SslMode {
        self.ssl_mode.unwrap_or(SslMode::Disable)
    }
}

/// User custom resource
///
/// Declares a login role with a generated password and a list of access
/// rules. The generated credentials are written to a Secret the operator
/// creates and never overwrites.
///
/// # Example
///
/// ```yaml
/// apiVersion: orchestrdb.mertsaygi.net/v1alpha1
/// kind: User
/// metadata:
///   name: alice
/// spec:
///   host: postgres.data.svc
///   port: 5432
///   adminSecretRef:
///     name: pg-admin
///   username: alice
///   generatedSecretRef:
///     name: alice-creds
///   access:
///     - dbName: orders
///       role: readwrite
///     - dbName: reporting
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "orchestrdb.mertsaygi.net",
    version = "v1alpha1",
    kind = "User",
    plural = "users",
    shortname = "pguser",
    namespaced,
    status = "ProvisionStatus",
    printcolumn = r#"{"name":"Username","type":"string","jsonPath":".spec.username"}"#,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".spec.generatedSecretRef.name"}"#,
    printcolumn = r#"{"name":"Created","type":"boolean","jsonPath":".status.created"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".status.lastError","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Hostname or IP address of the PostgreSQL server
    #[validate(length(min = 1, max = 253, message = "host must be 1-253 characters"))]
    pub host: String,

    /// Port of the PostgreSQL server
    #[validate(range(min = 1, max = 65535, message = "port must be between 1 and 65535"))]
    pub port: i32,

    /// Admin user allowed to create roles and grant privileges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_user: Option<String>,

    /// Admin password, for development only; prefer adminSecretRef
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,

    /// Secret holding admin credentials; takes precedence over inline fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub admin_secret_ref: Option<SecretRef>,

    /// SSL mode for the admin connection (default: require)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_mode: Option<SslMode>,

    /// Role name to create on the server
    #[validate(custom(function = "validate_pg_identifier"))]
    pub username: String,

    /// Secret the operator writes the generated username/password to
    #[serde(alias = "generatedSecret")]
    #[validate(nested)]
    pub generated_secret_ref: GeneratedSecretRef,

    /// Access rules, applied in order
    #[serde(default)]
    #[validate(length(max = 100, message = "maximum 100 access rules allowed"))]
    pub access: Vec<AccessRule>,
}

impl AdminConnectionSpec for UserSpec {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> i32 {
        self.port
    }

    fn admin_user(&self) -> Option<&str> {
        self.admin_user.as_deref()
    }

    fn admin_password(&self) -> Option<&str> {
        self.admin_password.as_deref()
    }

    fn admin_secret_ref(&self) -> Option<&SecretRef> {
        self.admin_secret_ref.as_ref()
    }

    fn ssl_mode(&self) -> SslMode {
        self.ssl_mode.unwrap_or(SslMode::Require)
    }
}

/// Kind of outcome recorded by the last reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum OutcomeReason {
    #[default]
    Succeeded,
    CredentialError,
    ConvergenceError,
    ConflictError,
}

/// Observed state written by the operator after every pass
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionStatus {
    /// Whether the most recent pass converged successfully
    #[serde(default)]
    pub created: bool,

    /// Error of the most recent pass, empty on success
    #[serde(default)]
    pub last_error: String,

    /// Time of the most recent pass (RFC 3339)
    #[serde(default)]
    pub updated_at: String,

    /// Outcome kind of the most recent pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<OutcomeReason>,

    /// Generation the most recent pass ran against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Resources that carry a [`ProvisionStatus`]
pub trait ProvisionedResource {
    fn provision_status(&self) -> Option<&ProvisionStatus>;
}

impl ProvisionedResource for Database {
    fn provision_status(&self) -> Option<&ProvisionStatus> {
        self.status.as_ref()
    }
}

impl ProvisionedResource for User {
    fn provision_status(&self) -> Option<&ProvisionStatus> {
        self.status.as_ref()
    }
}

/// Collect validator errors into one message
pub fn validation_message(errors: &validator::ValidationErrors) -> String {
    let mut messages: Vec<String> = Vec::new();
    collect_messages("", errors, &mut messages);
    messages.sort();
    messages.join("; ")
}

fn collect_messages(prefix: &str, errors: &validator::ValidationErrors, out: &mut Vec<String>) {
    use validator::ValidationErrorsKind;

    for (field, kind) in errors.errors() {
        let field = camel_case(field);
        let path = if prefix.is_empty() {
            field
        } else {
            format!("{}.{}", prefix, field)
        };
        match kind {
            ValidationErrorsKind::Field(errs) => {
                for e in errs {
                    let message = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string());
                    out.push(format!("{}: {}", path, message));
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_messages(&path, nested, out),
            ValidationErrorsKind::List(items) => {
                for (idx, nested) in items {
                    collect_messages(&format!("{}[{}]", path, idx), nested, out);
                }
            }
        }
    }
}

/// Field name as it appears in the resource manifest
fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
