pub mod sqlite;

pub use sqlite::SqliteDatabaseStore;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::models::{Database, DatabaseType};

/// Durable store of database configuration records
///
/// `save` and `delete` are atomic units of work: they either fully apply or
/// not at all. Uniqueness of names and of the identifiers flag is validated
/// by the registry, not here; the store only persists.
#[async_trait]
pub trait DatabaseStore: Send + Sync {
    /// All records, optionally filtered by type; order is store-defined
    async fn list(&self, type_filter: Option<DatabaseType>) -> Result<Vec<Database>, RegistryError>;

    /// Exact lookup by name
    async fn find_by_name(&self, name: &str) -> Result<Option<Database>, RegistryError>;

    /// Every record flagged as the identifiers database. More than one row
    /// here means the write-path invariant was breached; the registry checks.
    async fn find_used_for_identifiers(&self) -> Result<Vec<Database>, RegistryError>;

    /// Insert or replace by id
    async fn save(&self, database: &Database) -> Result<(), RegistryError>;

    /// Delete by id; returns whether a record existed
    async fn delete(&self, id: &str) -> Result<bool, RegistryError>;
}
