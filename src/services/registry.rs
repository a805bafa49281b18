use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Mutex;

use crate::error::RegistryError;
use crate::models::{Database, DatabaseType};
use crate::services::factory::{DataSource, DataSourceFactory, SessionFactory, SessionFactoryFactory};
use crate::services::resource_cache::{Loader, ResourceCache};
use crate::services::usage_registry::UsageRegistry;
use crate::storage::DatabaseStore;

/// Registry of database configurations and the live resources built from them
///
/// Owns two lazy caches (data sources and session factories, both keyed by
/// database name), the usage registry that gates configuration editability,
/// and the validation run before every configuration write. A configuration
/// write and the cache invalidation that follows it execute under a single
/// write lock, so no caller observes a half-applied change through this API.
///
/// A `get` racing a write on the same name may observe either the pre-write
/// or post-write configuration, never a partial one; callers needing
/// read-after-write consistency must serialize themselves.
pub struct DatabaseRegistry {
    store: Arc<dyn DatabaseStore>,
    usage: UsageRegistry,
    data_sources: Arc<ResourceCache<DataSource>>,
    session_factories: Arc<ResourceCache<SessionFactory>>,
    /// Serializes configuration writes with their cache invalidation
    write_lock: Mutex<()>,
    stopped: AtomicBool,
}

impl DatabaseRegistry {
    pub fn new(
        store: Arc<dyn DatabaseStore>,
        data_source_factory: Arc<dyn DataSourceFactory>,
        session_factory_factory: Arc<dyn SessionFactoryFactory>,
    ) -> Self {
        let data_sources: Arc<ResourceCache<DataSource>> = {
            let store = store.clone();
            let loader: Loader<DataSource> = Arc::new(move |name: String| {
                let store = store.clone();
                let factory = data_source_factory.clone();
                async move {
                    let database = store
                        .find_by_name(&name)
                        .await?
                        .ok_or_else(|| RegistryError::NoSuchDatabase(name.clone()))?;
                    factory.create_data_source(&database).await
                }
                .boxed()
            });
            Arc::new(ResourceCache::new("data source", loader))
        };

        let session_factories: Arc<ResourceCache<SessionFactory>> = {
            let data_sources = data_sources.clone();
            let loader: Loader<SessionFactory> = Arc::new(move |name: String| {
                let data_sources = data_sources.clone();
                let factory = session_factory_factory.clone();
                async move {
                    // Built on top of the cached data source, without
                    // declaring a usage owner of its own
                    let data_source = data_sources.get(&name).await?;
                    factory.create_session_factory(data_source).await
                }
                .boxed()
            });
            Arc::new(ResourceCache::new("session factory", loader))
        };

        Self {
            store,
            usage: UsageRegistry::new(),
            data_sources,
            session_factories,
            write_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    /// All configurations, optionally filtered by type; order is store-defined
    pub async fn list(
        &self,
        type_filter: Option<DatabaseType>,
    ) -> Result<Vec<Database>, RegistryError> {
        self.store.list(type_filter).await
    }

    /// Exact lookup by unique name
    pub async fn get_database(&self, name: &str) -> Result<Database, RegistryError> {
        self.store
            .find_by_name(name)
            .await?
            .ok_or_else(|| RegistryError::NoSuchDatabase(name.to_string()))
    }

    /// The single configuration flagged for identifiers, if any
    ///
    /// More than one flagged record means a write slipped past validation;
    /// that is reported as an invariant violation, not a user error.
    pub async fn identifiers_database(&self) -> Result<Option<Database>, RegistryError> {
        let mut flagged = self.store.find_used_for_identifiers().await?;
        match flagged.len() {
            0 => Ok(None),
            1 => Ok(Some(flagged.remove(0))),
            n => Err(RegistryError::InvariantViolation(format!(
                "{} databases are flagged as the identifiers database, expected at most one",
                n
            ))),
        }
    }

    /// Get the pooled data source for `name`, building it on first access
    ///
    /// When `used_by` names a consumer, the usage is recorded and the
    /// configuration becomes non-editable until the last consumer unregisters.
    pub async fn data_source(
        &self,
        name: &str,
        used_by: Option<&str>,
    ) -> Result<Arc<DataSource>, RegistryError> {
        self.ensure_running()?;
        self.get_database(name).await?;
        self.register(name, used_by).await?;
        self.data_sources.get(name).await
    }

    /// Get the session factory for `name`, building it (and the underlying
    /// data source) on first access. Same registration semantics as
    /// [`data_source`](Self::data_source).
    pub async fn session_factory(
        &self,
        name: &str,
        used_by: Option<&str>,
    ) -> Result<Arc<SessionFactory>, RegistryError> {
        self.ensure_running()?;
        self.get_database(name).await?;
        self.register(name, used_by).await?;
        self.session_factories.get(name).await
    }

    /// Create or replace a configuration: validate, persist, then invalidate
    /// any cached resources for the name so the next access rebuilds
    ///
    /// Validation failures leave the store untouched.
    pub async fn add_or_replace_database(&self, database: &Database) -> Result<(), RegistryError> {
        self.ensure_running()?;
        let _guard = self.write_lock.lock().await;
        self.validate_unique_name(database).await?;
        self.validate_single_identifiers_database(database).await?;
        self.store.save(database).await?;
        self.destroy_resources(&database.name).await;
        Ok(())
    }

    /// Delete a configuration and its cached resources
    ///
    /// Rejected while any usage registration exists for the name; dependents
    /// must unregister first.
    pub async fn delete_database(&self, database: &Database) -> Result<(), RegistryError> {
        self.ensure_running()?;
        let _guard = self.write_lock.lock().await;
        let mut used_by = self.usage.consumers_of(&database.name);
        if !used_by.is_empty() {
            used_by.sort();
            return Err(RegistryError::DatabaseInUse {
                name: database.name.clone(),
                used_by,
            });
        }
        self.store.delete(&database.id).await?;
        self.destroy_resources(&database.name).await;
        Ok(())
    }

    /// Remove a usage registration; when the last one for `name` goes away,
    /// the configuration becomes editable again
    ///
    /// Stays available after `stop()` so consumers can unwind their
    /// registrations while shutting down.
    pub async fn unregister(&self, name: &str, used_by: &str) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        // Persist the editability change before dropping the pair: a failed
        // save keeps the registration, and editable stays false with it.
        let consumers = self.usage.consumers_of(name);
        if consumers.iter().all(|c| c == used_by) {
            if let Some(mut database) = self.store.find_by_name(name).await? {
                if !database.editable {
                    database.editable = true;
                    self.store.save(&database).await?;
                }
            }
        }
        self.usage.unregister(name, used_by);
        Ok(())
    }

    /// Release every live resource. Resource access fails fast afterwards;
    /// plain configuration reads keep working.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping database registry");
        self.session_factories.shut_down().await;
        self.data_sources.shut_down().await;
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), RegistryError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RegistryError::Stopped);
        }
        Ok(())
    }

    async fn register(&self, name: &str, used_by: Option<&str>) -> Result<(), RegistryError> {
        let Some(consumer) = used_by.filter(|c| !c.is_empty()) else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let mut database = self
            .store
            .find_by_name(name)
            .await?
            .ok_or_else(|| RegistryError::NoSuchDatabase(name.to_string()))?;
        // Persist the editability change first; the pair is only recorded
        // once the store reflects it, so a failed save leaves no phantom
        // registration behind.
        if database.editable {
            database.editable = false;
            self.store.save(&database).await?;
        }
        self.usage.register(name, consumer);
        Ok(())
    }

    async fn validate_unique_name(&self, database: &Database) -> Result<(), RegistryError> {
        for existing in self.store.list(None).await? {
            if existing.id != database.id
                && existing.name.to_lowercase() == database.name.to_lowercase()
            {
                return Err(RegistryError::DuplicateDatabaseName(database.name.clone()));
            }
        }
        Ok(())
    }

    async fn validate_single_identifiers_database(
        &self,
        database: &Database,
    ) -> Result<(), RegistryError> {
        if !database.used_for_identifiers {
            return Ok(());
        }
        for existing in self.store.find_used_for_identifiers().await? {
            if existing.id != database.id {
                return Err(RegistryError::MultipleIdentifiersDatabases {
                    existing: existing.name,
                    candidate: database.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Session factory first, then the data source it was built on
    async fn destroy_resources(&self, name: &str) {
        self.session_factories.invalidate(name).await;
        self.data_sources.invalidate(name).await;
    }
}
