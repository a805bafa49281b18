use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RegistryError;

/// Database type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    MySQL,
}

impl DatabaseType {
    pub fn from_str(s: &str) -> Result<Self, RegistryError> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseType::PostgreSQL),
            "mysql" => Ok(DatabaseType::MySQL),
            _ => Err(RegistryError::Store(format!(
                "Unsupported database type: {}",
                s
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::PostgreSQL => "postgresql",
            DatabaseType::MySQL => "mysql",
        }
    }
}

/// A persisted database configuration record
///
/// Identity is `id`, which stays stable across renames; `name` is the lookup
/// key consumers use and must be unique (case-insensitively) among live
/// records. The record never holds live connection state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub id: String,
    pub name: String,
    pub database_type: DatabaseType,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Driver-specific settings, stored as a JSON column
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// False while any consumer holds a usage registration for this database
    pub editable: bool,
    /// At most one record in the store may have this flag set
    pub used_for_identifiers: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Database {
    pub fn new(name: impl Into<String>, database_type: DatabaseType, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            database_type,
            url: url.into(),
            username: None,
            password: None,
            properties: HashMap::new(),
            editable: true,
            used_for_identifiers: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn for_identifiers(mut self) -> Self {
        self.used_for_identifiers = true;
        self
    }

    /// Connection URL with the credential overrides folded in
    pub fn connection_url(&self) -> Result<String, RegistryError> {
        let mut parsed = url::Url::parse(&self.url)
            .map_err(|e| RegistryError::Connection(format!("Invalid URL for '{}': {}", self.name, e)))?;
        if let Some(username) = &self.username {
            parsed
                .set_username(username)
                .map_err(|_| RegistryError::Connection(format!("Cannot set username on URL for '{}'", self.name)))?;
        }
        if let Some(password) = &self.password {
            parsed
                .set_password(Some(password))
                .map_err(|_| RegistryError::Connection(format!("Cannot set password on URL for '{}'", self.name)))?;
        }
        Ok(parsed.to_string())
    }
}
