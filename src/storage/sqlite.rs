use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row};
use tokio::sync::Mutex;

use crate::error::RegistryError;
use crate::models::{Database, DatabaseType};
use crate::storage::DatabaseStore;

/// SQLite-backed store for database configuration records
/// Uses tokio::Mutex for async-friendly locking
pub struct SqliteDatabaseStore {
    conn: Mutex<Connection>,
}

impl SqliteDatabaseStore {
    /// Open (or create) the store at the given path
    pub async fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = if path_str.starts_with("sqlite:") {
            let mut cleaned = path_str.trim_start_matches("sqlite:");
            cleaned = cleaned.trim_start_matches("//");
            cleaned
        } else {
            path_str.as_ref()
        };

        let conn = Connection::open(clean_path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store, used by tests
    pub async fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS databases (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                database_type TEXT NOT NULL,
                url TEXT NOT NULL,
                username TEXT,
                password TEXT,
                properties_json TEXT NOT NULL DEFAULT '{}',
                editable INTEGER NOT NULL DEFAULT 1,
                used_for_identifiers INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_databases_name ON databases(name)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_databases_identifiers ON databases(used_for_identifiers)",
            [],
        )?;

        Ok(())
    }

    fn row_to_database(row: &Row<'_>) -> SqliteResult<Database> {
        let type_str: String = row.get(2)?;
        let database_type = DatabaseType::from_str(&type_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let properties_json: String = row.get(6)?;
        let properties: HashMap<String, String> =
            serde_json::from_str(&properties_json).unwrap_or_default();
        Ok(Database {
            id: row.get(0)?,
            name: row.get(1)?,
            database_type,
            url: row.get(3)?,
            username: row.get(4)?,
            password: row.get(5)?,
            properties,
            editable: row.get(7)?,
            used_for_identifiers: row.get(8)?,
            created_at: parse_timestamp(row, 9)?,
            updated_at: parse_timestamp(row, 10)?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, name, database_type, url, username, password, \
     properties_json, editable, used_for_identifiers, created_at, updated_at";

fn parse_timestamp(row: &Row<'_>, idx: usize) -> SqliteResult<chrono::DateTime<chrono::Utc>> {
    let text: String = row.get(idx)?;
    chrono::DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[async_trait]
impl DatabaseStore for SqliteDatabaseStore {
    async fn list(&self, type_filter: Option<DatabaseType>) -> Result<Vec<Database>, RegistryError> {
        let conn = self.conn.lock().await;
        let sql = match type_filter {
            Some(_) => format!(
                "SELECT {} FROM databases WHERE database_type = ?1 ORDER BY created_at DESC",
                SELECT_COLUMNS
            ),
            None => format!(
                "SELECT {} FROM databases ORDER BY created_at DESC",
                SELECT_COLUMNS
            ),
        };
        let mut stmt = conn.prepare(&sql)?;

        let mut databases = Vec::new();
        match type_filter {
            Some(t) => {
                let rows = stmt.query_map(rusqlite::params![t.as_str()], Self::row_to_database)?;
                for row in rows {
                    databases.push(row?);
                }
            }
            None => {
                let rows = stmt.query_map([], Self::row_to_database)?;
                for row in rows {
                    databases.push(row?);
                }
            }
        }
        Ok(databases)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Database>, RegistryError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM databases WHERE name = ?1", SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let result = stmt
            .query_row(rusqlite::params![name], Self::row_to_database)
            .optional()?;
        Ok(result)
    }

    async fn find_used_for_identifiers(&self) -> Result<Vec<Database>, RegistryError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM databases WHERE used_for_identifiers = 1",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_database)?;
        let mut databases = Vec::new();
        for row in rows {
            databases.push(row?);
        }
        Ok(databases)
    }

    async fn save(&self, database: &Database) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().await;
        let properties_json = serde_json::to_string(&database.properties)
            .map_err(|e| RegistryError::Store(e.to_string()))?;

        // Single atomic unit of work
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT OR REPLACE INTO databases
            (id, name, database_type, url, username, password, properties_json,
             editable, used_for_identifiers, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            rusqlite::params![
                database.id,
                database.name,
                database.database_type.as_str(),
                database.url,
                database.username,
                database.password,
                properties_json,
                database.editable,
                database.used_for_identifiers,
                database.created_at.to_rfc3339(),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, RegistryError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let rows_affected =
            tx.execute("DELETE FROM databases WHERE id = ?1", rusqlite::params![id])?;
        tx.commit()?;
        Ok(rows_affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> Database {
        Database::new(
            name,
            DatabaseType::PostgreSQL,
            format!("postgresql://localhost:5432/{}", name),
        )
    }

    #[tokio::test]
    async fn test_save_and_find_roundtrip() {
        let store = SqliteDatabaseStore::in_memory().await.unwrap();
        let mut db = sample("db1");
        db.properties
            .insert("schema".to_string(), "public".to_string());
        store.save(&db).await.unwrap();

        let found = store.find_by_name("db1").await.unwrap().unwrap();
        assert_eq!(found.id, db.id);
        assert_eq!(found.database_type, DatabaseType::PostgreSQL);
        assert_eq!(found.properties.get("schema").unwrap(), "public");
        assert!(found.editable);
    }

    #[tokio::test]
    async fn test_find_is_exact_match() {
        let store = SqliteDatabaseStore::in_memory().await.unwrap();
        store.save(&sample("db1")).await.unwrap();
        assert!(store.find_by_name("DB1").await.unwrap().is_none());
        assert!(store.find_by_name("db1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_replaces_by_id() {
        let store = SqliteDatabaseStore::in_memory().await.unwrap();
        let mut db = sample("db1");
        store.save(&db).await.unwrap();
        db.editable = false;
        store.save(&db).await.unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].editable);
    }

    #[tokio::test]
    async fn test_list_filters_by_type() {
        let store = SqliteDatabaseStore::in_memory().await.unwrap();
        store.save(&sample("pg")).await.unwrap();
        let my = Database::new("my", DatabaseType::MySQL, "mysql://localhost:3306/my");
        store.save(&my).await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let only_mysql = store.list(Some(DatabaseType::MySQL)).await.unwrap();
        assert_eq!(only_mysql.len(), 1);
        assert_eq!(only_mysql[0].name, "my");
    }

    #[tokio::test]
    async fn test_find_used_for_identifiers() {
        let store = SqliteDatabaseStore::in_memory().await.unwrap();
        store.save(&sample("plain")).await.unwrap();
        store
            .save(&sample("ids").for_identifiers())
            .await
            .unwrap();

        let flagged = store.find_used_for_identifiers().await.unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].name, "ids");
    }

    #[tokio::test]
    async fn test_delete() {
        let store = SqliteDatabaseStore::in_memory().await.unwrap();
        let db = sample("db1");
        store.save(&db).await.unwrap();
        assert!(store.delete(&db.id).await.unwrap());
        assert!(!store.delete(&db.id).await.unwrap());
        assert!(store.find_by_name("db1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_on_disk_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        {
            let store = SqliteDatabaseStore::new(&path).await.unwrap();
            store.save(&sample("db1")).await.unwrap();
        }
        let reopened = SqliteDatabaseStore::new(&path).await.unwrap();
        assert!(reopened.find_by_name("db1").await.unwrap().is_some());
    }
}
