use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::error::RegistryError;

/// A live resource that must be closed when its cache entry is evicted.
/// Release is best-effort: errors are logged by the cache and never surfaced.
#[async_trait]
pub trait Releasable: Send + Sync + 'static {
    async fn release(&self) -> anyhow::Result<()>;
}

/// Loader bound to a cache instance; builds the resource for a database name.
pub type Loader<R> =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<R, RegistryError>> + Send + Sync>;

type BuildFuture<R> = Shared<BoxFuture<'static, Result<Arc<R>, Arc<RegistryError>>>>;

enum Entry<R> {
    /// Fully built resource, handed out by reference until invalidated
    Ready(Arc<R>),
    /// Single in-flight build; concurrent callers await the same future
    Building { generation: u64, future: BuildFuture<R> },
}

/// Lazy cache of expensive-to-construct resources, keyed by database name
///
/// Guarantees at most one concurrent construction per name: the first caller
/// installs a shared build future and every concurrent caller awaits it, so
/// all of them see the same resource or the same failure. Failures are never
/// cached; a later `get` retries the build. Eviction invokes the release hook
/// on the evicted resource exactly once.
pub struct ResourceCache<R: Releasable> {
    /// Resource kind, for log output only
    kind: &'static str,
    entries: Mutex<HashMap<String, Entry<R>>>,
    generation: AtomicU64,
    /// Set by `shut_down`; checked under the entries lock so no build can
    /// be installed after the final drain
    closed: AtomicBool,
    loader: Loader<R>,
}

impl<R: Releasable> ResourceCache<R> {
    pub fn new(kind: &'static str, loader: Loader<R>) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            loader,
        }
    }

    /// Get the cached resource for `name`, building it if absent
    ///
    /// Blocks for the duration of the build when this caller is the one that
    /// installs it, or until the in-flight build completes otherwise. Fails
    /// with `Stopped` once the cache has been shut down.
    pub async fn get(&self, name: &str) -> Result<Arc<R>, RegistryError> {
        let (generation, future) = {
            let mut entries = self.entries.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(RegistryError::Stopped);
            }
            match entries.get(name) {
                Some(Entry::Ready(resource)) => return Ok(resource.clone()),
                Some(Entry::Building { future, .. }) => {
                    let future = future.clone();
                    drop(entries);
                    tracing::debug!("Awaiting in-flight {} build for {}", self.kind, name);
                    return future
                        .await
                        .map_err(|cause| RegistryError::construction(name, cause));
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let loader = self.loader.clone();
                    let owned_name = name.to_string();
                    let kind = self.kind;
                    let future: BuildFuture<R> = async move {
                        tracing::info!("Building {} {}", kind, owned_name);
                        loader(owned_name).await.map(Arc::new).map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    entries.insert(
                        name.to_string(),
                        Entry::Building {
                            generation,
                            future: future.clone(),
                        },
                    );
                    (generation, future)
                }
            }
        };

        // Installer path: await our own build, then settle the slot.
        let result = future.await;
        let mut entries = self.entries.lock().await;
        let still_ours = matches!(
            entries.get(name),
            Some(Entry::Building { generation: g, .. }) if *g == generation
        );
        match result {
            Ok(resource) => {
                if still_ours {
                    entries.insert(name.to_string(), Entry::Ready(resource.clone()));
                } else {
                    // Invalidated while building: the entry is already gone,
                    // so the fresh resource is released right away. Callers
                    // still receive it; its validity ended with the eviction.
                    drop(entries);
                    tracing::debug!(
                        "{} {} was invalidated during build, releasing orphan",
                        self.kind,
                        name
                    );
                    self.release(name, &resource).await;
                }
                Ok(resource)
            }
            Err(cause) => {
                // Failures are not cached; clear the slot so a retry rebuilds.
                if still_ours {
                    entries.remove(name);
                }
                Err(RegistryError::construction(name, cause))
            }
        }
    }

    /// Remove the entry for `name`, releasing the resource if one was built.
    /// Returns whether an entry was present. An in-flight build is never
    /// cancelled; its value is released by the builder once it completes.
    pub async fn invalidate(&self, name: &str) -> bool {
        let entry = self.entries.lock().await.remove(name);
        match entry {
            Some(Entry::Ready(resource)) => {
                self.release(name, &resource).await;
                true
            }
            Some(Entry::Building { .. }) => {
                tracing::debug!("Dropped in-flight {} build for {}", self.kind, name);
                true
            }
            None => false,
        }
    }

    /// Invalidate every entry
    pub async fn invalidate_all(&self) {
        let entries = {
            let mut entries = self.entries.lock().await;
            entries.drain().collect::<Vec<_>>()
        };
        for (name, entry) in entries {
            if let Entry::Ready(resource) = entry {
                self.release(&name, &resource).await;
            }
        }
    }

    /// Shut the cache down: refuse new builds from here on, then invalidate
    /// every entry. The flag is raised under the entries lock, so a `get`
    /// racing the shutdown either lands before the drain (and its resource
    /// is released here) or fails with `Stopped` instead of installing a
    /// build that nobody would ever release.
    pub async fn shut_down(&self) {
        let entries = {
            let mut entries = self.entries.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            entries.drain().collect::<Vec<_>>()
        };
        for (name, entry) in entries {
            if let Entry::Ready(resource) = entry {
                self.release(&name, &resource).await;
            }
        }
    }

    /// Number of cached entries, in-flight builds included
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn release(&self, name: &str, resource: &R) {
        tracing::info!("Destroying {} {}", self.kind, name);
        if let Err(e) = resource.release().await {
            tracing::warn!("Ignoring error while destroying {} {}: {}", self.kind, name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug)]
    struct TestResource {
        tag: usize,
        releases: Arc<AtomicUsize>,
        fail_release: bool,
    }

    #[async_trait]
    impl Releasable for TestResource {
        async fn release(&self) -> anyhow::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            if self.fail_release {
                anyhow::bail!("close failed");
            }
            Ok(())
        }
    }

    struct TestHarness {
        cache: Arc<ResourceCache<TestResource>>,
        builds: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    fn harness(build_delay: Duration, fail_builds: usize, fail_release: bool) -> TestHarness {
        let builds = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let loader: Loader<TestResource> = {
            let builds = builds.clone();
            let releases = releases.clone();
            Arc::new(move |name: String| {
                let builds = builds.clone();
                let releases = releases.clone();
                async move {
                    tokio::time::sleep(build_delay).await;
                    let tag = builds.fetch_add(1, Ordering::SeqCst);
                    if tag < fail_builds {
                        return Err(RegistryError::Connection(format!(
                            "cannot reach {}",
                            name
                        )));
                    }
                    Ok(TestResource {
                        tag,
                        releases,
                        fail_release,
                    })
                }
                .boxed()
            })
        };
        TestHarness {
            cache: Arc::new(ResourceCache::new("test resource", loader)),
            builds,
            releases,
        }
    }

    #[tokio::test]
    async fn test_concurrent_gets_build_once() {
        let h = harness(Duration::from_millis(20), 0, false);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = h.cache.clone();
            handles.push(tokio::spawn(async move { cache.get("db1").await }));
        }
        let mut tags = Vec::new();
        for handle in handles {
            tags.push(handle.await.unwrap().unwrap().tag);
        }
        assert_eq!(h.builds.load(Ordering::SeqCst), 1);
        assert!(tags.iter().all(|t| *t == tags[0]));
    }

    #[tokio::test]
    async fn test_shared_failure_then_retry_rebuilds() {
        let h = harness(Duration::from_millis(20), 1, false);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = h.cache.clone();
            handles.push(tokio::spawn(async move { cache.get("db1").await }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, RegistryError::Construction { .. }));
        }
        // One factory call for all four waiters
        assert_eq!(h.builds.load(Ordering::SeqCst), 1);
        // Failure was not cached; the retry triggers a fresh build
        let resource = h.cache.get("db1").await.unwrap();
        assert_eq!(resource.tag, 1);
        assert_eq!(h.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_triggers_rebuild() {
        let h = harness(Duration::ZERO, 0, false);
        let first = h.cache.get("db1").await.unwrap();
        assert!(h.cache.invalidate("db1").await);
        assert_eq!(h.releases.load(Ordering::SeqCst), 1);
        let second = h.cache.get("db1").await.unwrap();
        assert_ne!(first.tag, second.tag);
        assert_eq!(h.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_absent_is_noop() {
        let h = harness(Duration::ZERO, 0, false);
        assert!(!h.cache.invalidate("missing").await);
        assert_eq!(h.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_release_error_is_swallowed() {
        let h = harness(Duration::ZERO, 0, true);
        h.cache.get("db1").await.unwrap();
        assert!(h.cache.invalidate("db1").await);
        assert_eq!(h.releases.load(Ordering::SeqCst), 1);
        // Entry is gone despite the failed release
        assert_eq!(h.cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_all_releases_each_once() {
        let h = harness(Duration::ZERO, 0, false);
        for name in ["db1", "db2", "db3"] {
            h.cache.get(name).await.unwrap();
        }
        h.cache.invalidate_all().await;
        assert_eq!(h.releases.load(Ordering::SeqCst), 3);
        assert_eq!(h.cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_shut_down_releases_and_blocks_new_builds() {
        let h = harness(Duration::ZERO, 0, false);
        h.cache.get("db1").await.unwrap();
        h.cache.shut_down().await;
        assert_eq!(h.releases.load(Ordering::SeqCst), 1);
        // A get that lands after the drain must not install a build that
        // nothing would release
        let err = h.cache.get("db1").await.unwrap_err();
        assert!(matches!(err, RegistryError::Stopped));
        assert_eq!(h.builds.load(Ordering::SeqCst), 1);
        assert_eq!(h.cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_during_build_releases_orphan() {
        let h = harness(Duration::from_millis(50), 0, false);
        let cache = h.cache.clone();
        let getter = tokio::spawn(async move { cache.get("db1").await });
        // Let the build start, then yank the entry out from under it
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.cache.invalidate("db1").await);
        // The caller still receives the built value
        let resource = getter.await.unwrap().unwrap();
        assert_eq!(resource.tag, 0);
        // ...but it was released immediately and never cached
        assert_eq!(h.releases.load(Ordering::SeqCst), 1);
        assert_eq!(h.cache.len().await, 0);
    }
}
