use std::sync::Arc;

use thiserror::Error;

/// Registry error types
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no database registered under the name '{0}'")]
    NoSuchDatabase(String),

    #[error("a database named '{0}' already exists")]
    DuplicateDatabaseName(String),

    #[error(
        "database '{existing}' is already used for identifiers, '{candidate}' cannot be too"
    )]
    MultipleIdentifiersDatabases { existing: String, candidate: String },

    #[error("database '{name}' is in use by: {}", .used_by.join(", "))]
    DatabaseInUse { name: String, used_by: Vec<String> },

    #[error("failed to build resource for database '{database}': {cause}")]
    Construction {
        database: String,
        cause: Arc<RegistryError>,
    },

    #[error("configuration store error: {0}")]
    Store(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("database registry has been stopped")]
    Stopped,
}

impl RegistryError {
    /// Wrap a shared build failure for a given database name.
    pub fn construction(database: impl Into<String>, cause: Arc<RegistryError>) -> Self {
        RegistryError::Construction {
            database: database.into(),
            cause,
        }
    }
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        RegistryError::Store(err.to_string())
    }
}

impl From<anyhow::Error> for RegistryError {
    fn from(err: anyhow::Error) -> Self {
        RegistryError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_use_message_lists_consumers() {
        let err = RegistryError::DatabaseInUse {
            name: "db1".to_string(),
            used_by: vec!["tableA".to_string(), "tableB".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("db1"));
        assert!(msg.contains("tableA, tableB"));
    }

    #[test]
    fn test_construction_carries_cause() {
        let cause = Arc::new(RegistryError::Connection("refused".to_string()));
        let err = RegistryError::construction("db1", cause);
        assert!(err.to_string().contains("db1"));
        assert!(err.to_string().contains("refused"));
    }
}
