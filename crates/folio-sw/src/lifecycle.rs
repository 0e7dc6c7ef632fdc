//! Cache lifecycle manager: install, activate, and fetch interception.
//!
//! Every handler returns one value describing all the work of its phase.
//! The host treats the phase as finished when that future resolves, so
//! nothing a handler starts is left dangling except the explicitly detached
//! cache writes and background revalidations, whose handles are returned.
//! No handler returns an error: failures are logged and folded into the
//! outcome.

use std::sync::Arc;

use async_trait::async_trait;
use folio_core::WorkerConfig;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::cache::{Cache, CacheStorage};
use crate::fetch::{Request, Response};
use crate::network::Network;
use crate::policy::{self, Route};
use crate::{SwError, SwResult};

// ==================== Outcomes ====================

/// A manifest entry that could not be cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheFailure {
    pub url: String,
    pub reason: String,
}

/// Result of the install phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Bucket that was populated.
    pub cache_name: String,
    /// Manifest URLs now in the bucket.
    pub cached: Vec<String>,
    /// Manifest URLs that were skipped.
    pub failed: Vec<PrecacheFailure>,
    /// Activate without waiting for open pages to close.
    pub skip_waiting: bool,
}

impl InstallOutcome {
    /// Whether every manifest entry was cached.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of the activate phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateOutcome {
    /// The bucket that was kept.
    pub cache_name: String,
    /// Stale buckets removed.
    pub deleted: Vec<String>,
    /// Stale buckets that could not be removed.
    pub failed: Vec<String>,
    /// Take control of already-open pages.
    pub claim_clients: bool,
}

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Network,
    OfflinePage,
    Synthesized,
}

/// Response chosen for an intercepted request.
#[derive(Debug)]
pub struct FetchOutcome {
    pub response: Response,
    pub source: FetchSource,
    /// Background refresh of a cache hit. Dropping the handle detaches it.
    pub revalidation: Option<JoinHandle<()>>,
}

/// Whether the worker answers a request.
#[derive(Debug)]
pub enum FetchDecision {
    /// Not intercepted; the browser fetches natively.
    Passthrough,
    Respond(FetchOutcome),
}

impl FetchDecision {
    pub fn into_outcome(self) -> Option<FetchOutcome> {
        match self {
            FetchDecision::Passthrough => None,
            FetchDecision::Respond(outcome) => Some(outcome),
        }
    }
}

/// Result of a background sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    /// Tag is not one this worker handles.
    Ignored,
}

/// A notification to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
}

/// What the host should do after a notification click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickAction {
    /// Focus a window showing this URL, or open one.
    OpenWindow(Url),
}

// ==================== Lifecycle Trait ====================

/// Handlers for the worker lifecycle events, registered once with the host.
#[async_trait]
pub trait WorkerLifecycle: Send + Sync {
    async fn on_install(&self) -> InstallOutcome;

    async fn on_activate(&self) -> ActivateOutcome;

    async fn on_fetch(&self, request: Request) -> FetchDecision;

    async fn on_sync(&self, tag: &str) -> SyncOutcome;

    async fn on_push(&self, payload: Option<&[u8]>) -> Notification;

    async fn on_notification_click(&self, notification: &Notification) -> ClickAction;
}

// ==================== Manager ====================

/// Owns the current versioned bucket and applies the caching policy.
pub struct CacheLifecycleManager {
    config: Arc<WorkerConfig>,
    cache_name: String,
    manifest: Vec<Url>,
    offline_page: Option<Url>,
    click_url: Url,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
}

impl std::fmt::Debug for CacheLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLifecycleManager")
            .field("origin", &self.config.origin.as_str())
            .field("cache_name", &self.cache_name)
            .field("manifest", &self.manifest.len())
            .finish()
    }
}

impl CacheLifecycleManager {
    /// Build a manager from a validated config.
    pub fn new(
        config: WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
    ) -> SwResult<Self> {
        config.validate()?;

        let resolve = |path: &str| {
            config
                .origin
                .join(path)
                .map_err(|e| SwError::Config(format!("{}: {}", path, e)))
        };
        let manifest = config
            .precache_manifest()
            .iter()
            .map(|path| resolve(path.as_str()))
            .collect::<SwResult<Vec<_>>>()?;
        let offline_page = config.offline_page.as_deref().map(resolve).transpose()?;
        let click_url = resolve(&config.notification.click_url)?;

        Ok(Self {
            cache_name: config.cache_name(),
            config: Arc::new(config),
            manifest,
            offline_page,
            click_url,
            storage,
            network,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Name of the bucket this version owns.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Resolved precache URLs, in manifest order.
    pub fn manifest(&self) -> &[Url] {
        &self.manifest
    }

    fn origin(&self) -> &Url {
        &self.config.origin
    }

    async fn precache(&self, cache: &dyn Cache, url: &Url) -> SwResult<()> {
        let request = Request::get(url.clone());
        let response = self.network.fetch(&request).await?;
        if !policy::is_cacheable(&request, &response, self.origin()) {
            return Err(SwError::Network(format!(
                "unexpected response {} ({:?})",
                response.status, response.response_type
            )));
        }
        cache.put(&request, &response).await
    }

    async fn open_current(&self) -> Option<Arc<dyn Cache>> {
        match self.storage.open(&self.cache_name).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(cache = %self.cache_name, error = %e, "Failed to open cache");
                None
            }
        }
    }

    async fn fallback(&self, cache: Option<&dyn Cache>, request: &Request) -> FetchOutcome {
        if request.is_navigation() {
            if let (Some(cache), Some(page)) = (cache, &self.offline_page) {
                match cache.match_request(&Request::get(page.clone())).await {
                    Ok(Some(entry)) => {
                        debug!(url = %request.url, "Serving offline page");
                        return FetchOutcome {
                            response: Response::from_entry(page.clone(), &entry),
                            source: FetchSource::OfflinePage,
                            revalidation: None,
                        };
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Offline page lookup failed"),
                }
            }
        }

        FetchOutcome {
            response: Response::not_found(request.url.clone()),
            source: FetchSource::Synthesized,
            revalidation: None,
        }
    }
}

/// Write a response to the bucket, logging instead of failing.
async fn store_entry(cache: Arc<dyn Cache>, request: Request, response: Response) {
    match cache.put(&request, &response).await {
        Ok(()) => trace!(url = %request.url, "Cached response"),
        Err(e) => warn!(cache = %cache.name(), url = %request.url, error = %e, "Cache write failed"),
    }
}

async fn revalidate(
    cache: Arc<dyn Cache>,
    network: Arc<dyn Network>,
    request: Request,
    origin: Url,
) {
    match network.fetch(&request).await {
        Ok(response) if policy::is_cacheable(&request, &response, &origin) => {
            store_entry(cache, request, response).await;
        }
        Ok(response) => {
            debug!(url = %request.url, status = response.status, "Background fetch not cacheable");
        }
        Err(e) => warn!(url = %request.url, error = %e, "Background fetch failed"),
    }
}

#[async_trait]
impl WorkerLifecycle for CacheLifecycleManager {
    async fn on_install(&self) -> InstallOutcome {
        let mut outcome = InstallOutcome {
            cache_name: self.cache_name.clone(),
            skip_waiting: self.config.skip_waiting,
            ..Default::default()
        };

        let cache = match self.storage.open(&self.cache_name).await {
            Ok(cache) => cache,
            Err(e) => {
                error!(cache = %self.cache_name, error = %e, "Failed to open cache for install");
                outcome.failed = self
                    .manifest
                    .iter()
                    .map(|url| PrecacheFailure {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })
                    .collect();
                return outcome;
            }
        };
        info!(cache = %self.cache_name, entries = self.manifest.len(), "Opened cache");

        let results = join_all(
            self.manifest
                .iter()
                .map(|url| self.precache(cache.as_ref(), url)),
        )
        .await;

        for (url, result) in self.manifest.iter().zip(results) {
            match result {
                Ok(()) => outcome.cached.push(url.to_string()),
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to cache resource");
                    outcome.failed.push(PrecacheFailure {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            cache = %self.cache_name,
            cached = outcome.cached.len(),
            failed = outcome.failed.len(),
            "Install finished"
        );
        outcome
    }

    async fn on_activate(&self) -> ActivateOutcome {
        let mut outcome = ActivateOutcome {
            cache_name: self.cache_name.clone(),
            claim_clients: self.config.claim_clients,
            ..Default::default()
        };

        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                error!(error = %e, "Failed to list caches; stale caches kept until next activation");
                return outcome;
            }
        };

        let stale: Vec<String> = names
            .into_iter()
            .filter(|name| name != &self.cache_name)
            .collect();

        let results = join_all(stale.iter().map(|name| async move {
            info!(cache = %name, "Deleting old cache");
            self.storage.delete(name).await
        }))
        .await;

        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(_) => outcome.deleted.push(name),
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete old cache");
                    outcome.failed.push(name);
                }
            }
        }

        info!(
            cache = %self.cache_name,
            deleted = outcome.deleted.len(),
            failed = outcome.failed.len(),
            "Activated"
        );
        outcome
    }

    async fn on_fetch(&self, request: Request) -> FetchDecision {
        if let Route::Passthrough(reason) = policy::route(&request, self.origin()) {
            trace!(url = %request.url, method = %request.method, ?reason, "Not intercepting");
            return FetchDecision::Passthrough;
        }

        let cache = self.open_current().await;

        if let Some(cache) = &cache {
            match cache.match_request(&request).await {
                Ok(Some(entry)) => {
                    debug!(url = %request.url, "Cache hit");
                    let response = Response::from_entry(request.url.clone(), &entry);
                    let revalidation = self.config.revalidate_on_hit.then(|| {
                        tokio::spawn(revalidate(
                            Arc::clone(cache),
                            Arc::clone(&self.network),
                            request,
                            self.origin().clone(),
                        ))
                    });
                    return FetchDecision::Respond(FetchOutcome {
                        response,
                        source: FetchSource::Cache,
                        revalidation,
                    });
                }
                Ok(None) => debug!(url = %request.url, "Cache miss"),
                Err(e) => warn!(url = %request.url, error = %e, "Cache lookup failed"),
            }
        }

        match self.network.fetch(&request).await {
            Ok(response) => {
                if let Some(cache) = &cache {
                    if policy::is_cacheable(&request, &response, self.origin()) {
                        // Spawned so the write finishes even if this fetch is abandoned.
                        let write = tokio::spawn(store_entry(
                            Arc::clone(cache),
                            request.clone(),
                            response.clone(),
                        ));
                        if let Err(e) = write.await {
                            warn!(url = %request.url, error = %e, "Cache write task failed");
                        }
                    }
                }
                FetchDecision::Respond(FetchOutcome {
                    response,
                    source: FetchSource::Network,
                    revalidation: None,
                })
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Fetch failed");
                FetchDecision::Respond(self.fallback(cache.as_deref(), &request).await)
            }
        }
    }

    async fn on_sync(&self, tag: &str) -> SyncOutcome {
        if tag == self.config.sync_tag {
            debug!(tag, "Background sync");
            SyncOutcome::Completed
        } else {
            trace!(tag, "Ignoring sync tag");
            SyncOutcome::Ignored
        }
    }

    async fn on_push(&self, payload: Option<&[u8]>) -> Notification {
        let body = payload
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();
        let settings = &self.config.notification;
        Notification {
            title: settings.title.clone(),
            body,
            icon: settings.icon.clone(),
            badge: settings.badge.clone(),
        }
    }

    async fn on_notification_click(&self, notification: &Notification) -> ClickAction {
        debug!(title = %notification.title, "Notification clicked");
        ClickAction::OpenWindow(self.click_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::fetch::ResponseType;
    use crate::cache::CacheEntry;
    use crate::testing::{FaultyStorage, StubNetwork};
    use bytes::Bytes;
    use tokio::sync::Notify;

    fn config(origin: &Url) -> WorkerConfig {
        WorkerConfig {
            precache: vec!["/".into(), "/index.html".into(), "/styles.css".into()],
            ..Default::default()
        }
        .with_origin(origin.clone())
    }

    fn site() -> Arc<StubNetwork> {
        let network = StubNetwork::new(Url::parse("https://folio.example/").unwrap());
        network.serve("/", "<h1>home</h1>");
        network.serve("/index.html", "<h1>home</h1>");
        network.serve("/styles.css", "body { margin: 0 }");
        network.serve("/offline.html", "<h1>offline</h1>");
        Arc::new(network)
    }

    fn manager(
        storage: Arc<dyn CacheStorage>,
        network: Arc<StubNetwork>,
    ) -> CacheLifecycleManager {
        CacheLifecycleManager::new(config(network.origin()), storage, network).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let bad = WorkerConfig {
            precache: vec!["styles.css".into()],
            ..Default::default()
        };
        let result = CacheLifecycleManager::new(
            bad,
            Arc::new(MemoryCacheStorage::new()),
            site(),
        );
        assert!(matches!(result, Err(SwError::Config(_))));
    }

    #[tokio::test]
    async fn test_install_caches_manifest() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = site();
        let manager = manager(storage.clone(), network.clone());

        let outcome = manager.on_install().await;

        assert!(outcome.is_complete());
        assert!(outcome.skip_waiting);
        assert_eq!(outcome.cache_name, "portfolio-cache-v1");
        assert_eq!(outcome.cached.len(), 4);
        let cache = storage.get("portfolio-cache-v1").await.unwrap();
        assert_eq!(cache.len().await, 4);
    }

    #[tokio::test]
    async fn test_install_skips_failed_entries() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = site();
        network.fail("/styles.css", "connection reset");
        network.serve_status("/index.html", 500, "boom");
        let manager = manager(storage.clone(), network.clone());

        let outcome = manager.on_install().await;

        assert!(!outcome.is_complete());
        assert!(outcome.skip_waiting);
        let failed: Vec<&str> = outcome.failed.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(
            failed,
            vec!["https://folio.example/index.html", "https://folio.example/styles.css"]
        );
        assert_eq!(storage.get("portfolio-cache-v1").await.unwrap().len().await, 2);
    }

    #[tokio::test]
    async fn test_install_offline_still_resolves() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = site();
        network.set_offline(true);
        let manager = manager(storage.clone(), network);

        let outcome = manager.on_install().await;

        assert!(outcome.cached.is_empty());
        assert_eq!(outcome.failed.len(), 4);
        assert!(storage.has("portfolio-cache-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_install_open_failure_is_contained() {
        let storage = Arc::new(FaultyStorage::new());
        storage.fail_open(true);
        let manager = manager(storage, site());

        let outcome = manager.on_install().await;

        assert!(outcome.cached.is_empty());
        assert_eq!(outcome.failed.len(), 4);
        assert!(outcome.skip_waiting);
    }

    #[tokio::test]
    async fn test_activate_deletes_stale_caches() {
        let storage = Arc::new(MemoryCacheStorage::new());
        for stale in ["portfolio-cache-v0", "portfolio-cache-v1-v1", "other"] {
            storage.open(stale).await.unwrap();
        }
        let manager = manager(storage.clone(), site());
        manager.on_install().await;

        let outcome = manager.on_activate().await;

        assert_eq!(outcome.deleted.len(), 3);
        assert!(outcome.failed.is_empty());
        assert!(outcome.claim_clients);
        assert_eq!(storage.keys().await.unwrap(), vec!["portfolio-cache-v1".to_string()]);
    }

    #[tokio::test]
    async fn test_activate_deletion_failure_is_reported() {
        let storage = Arc::new(FaultyStorage::new());
        storage.inner().open("portfolio-cache-v0").await.unwrap();
        storage.inner().open("portfolio-cache-v00").await.unwrap();
        storage.fail_delete("portfolio-cache-v0");
        let manager = manager(storage.clone(), site());

        let outcome = manager.on_activate().await;

        assert_eq!(outcome.failed, vec!["portfolio-cache-v0".to_string()]);
        assert_eq!(outcome.deleted, vec!["portfolio-cache-v00".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_hit_skips_network_wait() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = site();
        let manager = manager(storage, network.clone());
        manager.on_install().await;

        network.serve("/styles.css", "body { margin: 1px }");
        network.pause();

        let url = network.url("/styles.css");
        let outcome = manager
            .on_fetch(Request::get(url.clone()))
            .await
            .into_outcome()
            .unwrap();

        assert_eq!(outcome.source, FetchSource::Cache);
        assert!(outcome.response.from_cache);
        assert_eq!(outcome.response.body, Bytes::from_static(b"body { margin: 0 }"));

        network.resume();
        outcome.revalidation.unwrap().await.unwrap();

        let refreshed = manager
            .on_fetch(Request::get(url))
            .await
            .into_outcome()
            .unwrap();
        assert_eq!(refreshed.response.body, Bytes::from_static(b"body { margin: 1px }"));
    }

    #[tokio::test]
    async fn test_fetch_hit_without_revalidation() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = site();
        let mut cfg = config(network.origin());
        cfg.revalidate_on_hit = false;
        let manager = CacheLifecycleManager::new(cfg, storage, network.clone()).unwrap();
        manager.on_install().await;
        let before = network.call_count("/styles.css");

        let outcome = manager
            .on_fetch(Request::get(network.url("/styles.css")))
            .await
            .into_outcome()
            .unwrap();

        assert!(outcome.revalidation.is_none());
        assert_eq!(network.call_count("/styles.css"), before);
    }

    #[tokio::test]
    async fn test_background_failure_keeps_cached_entry() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = site();
        let manager = manager(storage, network.clone());
        manager.on_install().await;
        network.set_offline(true);

        let outcome = manager
            .on_fetch(Request::get(network.url("/index.html")))
            .await
            .into_outcome()
            .unwrap();
        outcome.revalidation.unwrap().await.unwrap();

        let again = manager
            .on_fetch(Request::get(network.url("/index.html")))
            .await
            .into_outcome()
            .unwrap();
        assert_eq!(again.source, FetchSource::Cache);
        assert_eq!(again.response.text(), "<h1>home</h1>");
    }

    #[tokio::test]
    async fn test_fetch_miss_then_hit() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = site();
        network.serve("/projects.html", "<h1>projects</h1>");
        let manager = manager(storage, network.clone());

        let first = manager
            .on_fetch(Request::get(network.url("/projects.html")))
            .await
            .into_outcome()
            .unwrap();
        assert_eq!(first.source, FetchSource::Network);
        assert!(!first.response.from_cache);

        let second = manager
            .on_fetch(Request::get(network.url("/projects.html")))
            .await
            .into_outcome()
            .unwrap();
        assert_eq!(second.source, FetchSource::Cache);
        assert_eq!(second.response.body, first.response.body);
    }

    /// Storage whose puts announce themselves and then wait to be released.
    struct HeldWrites {
        inner: Arc<MemoryCacheStorage>,
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    struct HeldCache {
        inner: Arc<dyn Cache>,
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Cache for HeldCache {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn match_request(&self, request: &Request) -> SwResult<Option<CacheEntry>> {
            self.inner.match_request(request).await
        }

        async fn put(&self, request: &Request, response: &Response) -> SwResult<()> {
            self.started.notify_one();
            self.release.notified().await;
            self.inner.put(request, response).await
        }

        async fn delete(&self, request: &Request) -> SwResult<bool> {
            self.inner.delete(request).await
        }

        async fn keys(&self) -> SwResult<Vec<String>> {
            self.inner.keys().await
        }
    }

    #[async_trait]
    impl CacheStorage for HeldWrites {
        async fn open(&self, name: &str) -> SwResult<Arc<dyn Cache>> {
            let cache: Arc<dyn Cache> = Arc::new(HeldCache {
                inner: self.inner.open(name).await?,
                started: Arc::clone(&self.started),
                release: Arc::clone(&self.release),
            });
            Ok(cache)
        }

        async fn has(&self, name: &str) -> SwResult<bool> {
            self.inner.has(name).await
        }

        async fn delete(&self, name: &str) -> SwResult<bool> {
            self.inner.delete(name).await
        }

        async fn keys(&self) -> SwResult<Vec<String>> {
            self.inner.keys().await
        }
    }

    #[tokio::test]
    async fn test_miss_write_survives_abandoned_fetch() {
        let inner = Arc::new(MemoryCacheStorage::new());
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let storage = Arc::new(HeldWrites {
            inner: Arc::clone(&inner),
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });
        let network = site();
        network.serve("/projects.html", "<h1>projects</h1>");
        let manager = Arc::new(manager(storage, network.clone()));

        let fetch = {
            let manager = Arc::clone(&manager);
            let url = network.url("/projects.html");
            tokio::spawn(async move { manager.on_fetch(Request::get(url)).await })
        };
        started.notified().await;

        fetch.abort();
        assert!(fetch.await.unwrap_err().is_cancelled());

        release.notify_one();
        let bucket = inner.get("portfolio-cache-v1").await.unwrap();
        for _ in 0..100 {
            if !bucket.is_empty().await {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(bucket.len().await, 1);
        network.set_offline(true);
        let cached = manager
            .on_fetch(Request::get(network.url("/projects.html")))
            .await
            .into_outcome()
            .unwrap();
        assert_eq!(cached.source, FetchSource::Cache);
    }

    #[tokio::test]
    async fn test_uncacheable_response_returned_not_stored() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = site();
        network.serve_status("/missing.html", 404, "nope");
        let manager = manager(storage.clone(), network.clone());

        let outcome = manager
            .on_fetch(Request::get(network.url("/missing.html")))
            .await
            .into_outcome()
            .unwrap();

        assert_eq!(outcome.response.status, 404);
        assert_eq!(outcome.source, FetchSource::Network);
        let cache = storage.get("portfolio-cache-v1").await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_offline_navigation_gets_offline_page() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = site();
        let manager = manager(storage, network.clone());
        manager.on_install().await;
        network.set_offline(true);

        let outcome = manager
            .on_fetch(Request::navigate(network.url("/projects.html")))
            .await
            .into_outcome()
            .unwrap();

        assert_eq!(outcome.source, FetchSource::OfflinePage);
        assert_eq!(outcome.response.status, 200);
        assert_eq!(outcome.response.text(), "<h1>offline</h1>");
    }

    #[tokio::test]
    async fn test_offline_subresource_gets_synthesized_response() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = site();
        let manager = manager(storage, network.clone());
        manager.on_install().await;
        network.set_offline(true);

        let outcome = manager
            .on_fetch(Request::get(network.url("/images/new.png")))
            .await
            .into_outcome()
            .unwrap();

        assert_eq!(outcome.source, FetchSource::Synthesized);
        assert_eq!(outcome.response.status, 404);
    }

    #[tokio::test]
    async fn test_offline_empty_bucket_falls_back() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = site();
        network.set_offline(true);
        let manager = manager(storage, network.clone());

        let outcome = manager
            .on_fetch(Request::navigate(network.url("/")))
            .await
            .into_outcome()
            .unwrap();

        assert_eq!(outcome.source, FetchSource::Synthesized);
        assert_eq!(outcome.response.status, 404);
        assert_eq!(outcome.response.response_type, ResponseType::Basic);
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_returns_response() {
        let storage = Arc::new(FaultyStorage::new());
        storage.fail_puts(true);
        let network = site();
        let manager = manager(storage.clone(), network.clone());

        let outcome = manager
            .on_fetch(Request::get(network.url("/styles.css")))
            .await
            .into_outcome()
            .unwrap();

        assert_eq!(outcome.source, FetchSource::Network);
        assert_eq!(outcome.response.status, 200);
        let cache = storage.inner().get("portfolio-cache-v1").await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_cache_lookup_failure_treated_as_miss() {
        let storage = Arc::new(FaultyStorage::new());
        storage.fail_matches(true);
        let network = site();
        let manager = manager(storage, network.clone());

        let outcome = manager
            .on_fetch(Request::get(network.url("/index.html")))
            .await
            .into_outcome()
            .unwrap();

        assert_eq!(outcome.source, FetchSource::Network);
        assert_eq!(network.call_count("/index.html"), 1);
    }

    #[tokio::test]
    async fn test_sync_tags() {
        let manager = manager(Arc::new(MemoryCacheStorage::new()), site());
        assert_eq!(manager.on_sync("sync-data").await, SyncOutcome::Completed);
        assert_eq!(manager.on_sync("other").await, SyncOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_push_builds_notification() {
        let manager = manager(Arc::new(MemoryCacheStorage::new()), site());

        let notification = manager.on_push(Some(b"New project posted")).await;
        assert_eq!(notification.title, "Portfolio Update");
        assert_eq!(notification.body, "New project posted");
        assert_eq!(notification.icon, "/images/icon.png");
        assert_eq!(notification.badge, "/images/badge.png");

        let empty = manager.on_push(None).await;
        assert!(empty.body.is_empty());
    }

    #[tokio::test]
    async fn test_click_opens_root() {
        let manager = manager(Arc::new(MemoryCacheStorage::new()), site());
        let notification = manager.on_push(Some(b"hi")).await;

        let action = manager.on_notification_click(&notification).await;
        assert_eq!(
            action,
            ClickAction::OpenWindow(Url::parse("https://folio.example/").unwrap())
        );
    }
}
