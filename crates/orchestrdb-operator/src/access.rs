//! Access rules and grant planning
//!
//! User access rules arrive as free-form strings. They are parsed once per
//! pass into [`AccessGrant`]s, and grant planning only ever sees the closed
//! enums. Planning is pure: it turns a grant into the ordered SQL statements
//! the executor runs, each tagged with the session it must run in.

use crate::crd::AccessRule;
use crate::error::{OperatorError, Result};
use std::fmt;
use std::str::FromStr;

/// Privilege level granted on a database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AccessRole {
    #[default]
    ReadOnly,
    ReadWrite,
    Owner,
}

impl FromStr for AccessRole {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "readonly" => Ok(AccessRole::ReadOnly),
            "readwrite" => Ok(AccessRole::ReadWrite),
            "owner" => Ok(AccessRole::Owner),
            other => Err(OperatorError::UnsupportedValue {
                field: "role",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for AccessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessRole::ReadOnly => write!(f, "readonly"),
            AccessRole::ReadWrite => write!(f, "readwrite"),
            AccessRole::Owner => write!(f, "owner"),
        }
    }
}

/// Where an access rule applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AccessScope {
    #[default]
    Database,
    Instance,
}

impl FromStr for AccessScope {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "database" => Ok(AccessScope::Database),
            "instance" => Ok(AccessScope::Instance),
            other => Err(OperatorError::UnsupportedValue {
                field: "scope",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for AccessScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessScope::Database => write!(f, "database"),
            AccessScope::Instance => write!(f, "instance"),
        }
    }
}

/// A validated access rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    /// Target database, `None` when the rule left it empty
    pub db_name: Option<String>,
    pub role: AccessRole,
    pub scope: AccessScope,
}

impl AccessGrant {
    /// Parse a rule, applying the readonly / database defaults
    pub fn from_rule(rule: &AccessRule) -> Result<Self> {
        let role = rule.role.as_deref().unwrap_or_default().parse()?;
        let scope = rule.scope.as_deref().unwrap_or_default().parse()?;
        let db_name = rule.db_name.clone().filter(|name| !name.is_empty());

        Ok(Self {
            db_name,
            role,
            scope,
        })
    }
}

/// Validate every rule; the first unsupported value fails the whole list
pub fn validate_rules(rules: &[AccessRule]) -> Result<Vec<AccessGrant>> {
    rules.iter().map(AccessGrant::from_rule).collect()
}

/// Session a grant statement runs in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GrantSession {
    /// The administrative session on the bootstrap database
    Admin,
    /// A session connected to the named database
    Database(String),
}

/// One planned grant statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantStatement {
    pub session: GrantSession,
    pub sql: String,
}

impl GrantStatement {
    fn admin(sql: String) -> Self {
        Self {
            session: GrantSession::Admin,
            sql,
        }
    }

    fn on_database(db_name: &str, sql: String) -> Self {
        Self {
            session: GrantSession::Database(db_name.to_string()),
            sql,
        }
    }
}

/// Plan the statements that apply one grant to `username`
///
/// A grant without a database name plans nothing, in either scope.
pub fn plan_grants(username: &str, grant: &AccessGrant) -> Vec<GrantStatement> {
    let Some(db_name) = grant.db_name.as_deref() else {
        return Vec::new();
    };

    let user = quote_ident(username);
    let db = quote_ident(db_name);
    let mut statements = Vec::new();

    if grant.scope == AccessScope::Instance {
        statements.push(GrantStatement::admin(format!(
            "GRANT CONNECT ON DATABASE {} TO {}",
            db, user
        )));
        return statements;
    }

    if grant.role == AccessRole::Owner {
        statements.push(GrantStatement::admin(format!(
            "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
            db, user
        )));
    }

    statements.push(GrantStatement::admin(format!(
        "GRANT CONNECT ON DATABASE {} TO {}",
        db, user
    )));
    statements.push(GrantStatement::on_database(
        db_name,
        format!("GRANT USAGE ON SCHEMA public TO {}", user),
    ));

    let privileges = match grant.role {
        AccessRole::ReadOnly => "SELECT",
        AccessRole::ReadWrite | AccessRole::Owner => "SELECT, INSERT, UPDATE, DELETE",
    };
    statements.push(GrantStatement::on_database(
        db_name,
        format!(
            "GRANT {} ON ALL TABLES IN SCHEMA public TO {}",
            privileges, user
        ),
    ));

    statements
}

/// Plan every grant in order
pub fn plan_all(username: &str, grants: &[AccessGrant]) -> Vec<GrantStatement> {
    grants
        .iter()
        .flat_map(|grant| plan_grants(username, grant))
        .collect()
}

/// Quote a PostgreSQL identifier, doubling embedded quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a PostgreSQL string literal, doubling embedded single quotes
///
/// Used for `PASSWORD '...'`, which cannot be a bind parameter.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
