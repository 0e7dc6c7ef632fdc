//! Scripted collaborators for exercising the worker without a browser.
//!
//! `StubNetwork` serves canned responses for an origin and can be switched
//! offline or paused. `FaultyStorage` wraps a memory store and fails the
//! operations a test asks it to.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use tokio::sync::watch;

use crate::cache::{Cache, CacheEntry, CacheStorage, MemoryCacheStorage};
use crate::fetch::{Request, RequestMode, Response, ResponseType};
use crate::network::Network;
use crate::policy::same_origin;
use crate::{SwError, SwResult};
use url::Url;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ==================== Stub Network ====================

#[derive(Debug, Clone)]
enum StubRoute {
    Respond(Response),
    Fail(String),
}

/// A network that answers from a table of routes.
///
/// Unknown same-origin URLs get a plain 404, like a static file server.
#[derive(Debug)]
pub struct StubNetwork {
    origin: Url,
    routes: Mutex<HashMap<String, StubRoute>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
    paused: watch::Sender<bool>,
}

impl StubNetwork {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            paused: watch::Sender::new(false),
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Resolve a path against the origin.
    pub fn url(&self, path: &str) -> Url {
        self.origin.join(path).unwrap_or_else(|_| self.origin.clone())
    }

    /// Serve `body` with status 200 at `path`.
    pub fn serve(&self, path: &str, body: impl Into<Bytes>) {
        self.serve_status(path, 200, body);
    }

    /// Serve `body` with the given status at `path`.
    pub fn serve_status(&self, path: &str, status: u16, body: impl Into<Bytes>) {
        let url = self.url(path);
        self.serve_response(Response::new(url, status, body));
    }

    /// Serve a prepared response at its own URL.
    pub fn serve_response(&self, response: Response) {
        let mut key = response.url.clone();
        key.set_fragment(None);
        lock(&self.routes).insert(key.into(), StubRoute::Respond(response));
    }

    /// Make requests for `path` fail at the transport level.
    pub fn fail(&self, path: &str, reason: &str) {
        lock(&self.routes).insert(
            self.url(path).into(),
            StubRoute::Fail(reason.to_string()),
        );
    }

    /// Fail every request while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold all fetches until `resume` is called.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// URLs fetched so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// How many times `path` was fetched.
    pub fn call_count(&self, path: &str) -> usize {
        let url = self.url(path).to_string();
        lock(&self.calls).iter().filter(|c| **c == url).count()
    }

    fn classify(&self, request: &Request, mut response: Response) -> Response {
        if response.response_type != ResponseType::Basic || same_origin(&response.url, &self.origin)
        {
            return response;
        }
        if request.mode == RequestMode::NoCors {
            response.status = 0;
            response.status_text.clear();
            response.headers.clear();
            response.body = Bytes::new();
            response.response_type = ResponseType::Opaque;
        } else {
            response.response_type = ResponseType::Cors;
        }
        response
    }
}

#[async_trait]
impl Network for StubNetwork {
    async fn fetch(&self, request: &Request) -> SwResult<Response> {
        lock(&self.calls).push(request.url.to_string());

        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;

        if self.offline.load(Ordering::SeqCst) {
            return Err(SwError::Network("offline".to_string()));
        }

        let route = lock(&self.routes).get(&request.cache_key()).cloned();
        let response = match route {
            Some(StubRoute::Respond(response)) => response,
            Some(StubRoute::Fail(reason)) => return Err(SwError::Network(reason)),
            None => Response::new(request.url.clone(), 404, "Not Found"),
        };
        Ok(self.classify(request, response))
    }
}

// ==================== Faulty Storage ====================

#[derive(Debug, Default)]
struct Faults {
    open: AtomicBool,
    keys: AtomicBool,
    puts: AtomicBool,
    matches: AtomicBool,
    deletes: Mutex<HashSet<String>>,
}

/// Memory storage with switchable failures.
#[derive(Debug, Default)]
pub struct FaultyStorage {
    inner: MemoryCacheStorage,
    faults: Arc<Faults>,
}

impl FaultyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped store, for setup and inspection.
    pub fn inner(&self) -> &MemoryCacheStorage {
        &self.inner
    }

    pub fn fail_open(&self, fail: bool) {
        self.faults.open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_keys(&self, fail: bool) {
        self.faults.keys.store(fail, Ordering::SeqCst);
    }

    pub fn fail_puts(&self, fail: bool) {
        self.faults.puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_matches(&self, fail: bool) {
        self.faults.matches.store(fail, Ordering::SeqCst);
    }

    /// Make deleting the bucket `name` fail.
    pub fn fail_delete(&self, name: &str) {
        lock(&self.faults.deletes).insert(name.to_string());
    }
}

struct FaultyCache {
    inner: Arc<dyn Cache>,
    faults: Arc<Faults>,
}

#[async_trait]
impl Cache for FaultyCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn match_request(&self, request: &Request) -> SwResult<Option<CacheEntry>> {
        if self.faults.matches.load(Ordering::SeqCst) {
            return Err(SwError::Storage("injected read failure".to_string()));
        }
        self.inner.match_request(request).await
    }

    async fn put(&self, request: &Request, response: &Response) -> SwResult<()> {
        if self.faults.puts.load(Ordering::SeqCst) {
            return Err(SwError::QuotaExceeded {
                needed: response.size(),
                available: 0,
            });
        }
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
impl CacheStorage for FaultyStorage {
    async fn open(&self, name: &str) -> SwResult<Arc<dyn Cache>> {
        if self.faults.open.load(Ordering::SeqCst) {
            return Err(SwError::Storage("injected open failure".to_string()));
        }
        let inner = self.inner.open(name).await?;
        Ok(Arc::new(FaultyCache {
            inner,
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn has(&self, name: &str) -> SwResult<bool> {
        self.inner.has(name).await
    }

    async fn delete(&self, name: &str) -> SwResult<bool> {
        let injected = lock(&self.faults.deletes).contains(name);
        if injected {
            return Err(SwError::Storage(format!("injected delete failure: {}", name)));
        }
        self.inner.delete(name).await
    }

    async fn keys(&self) -> SwResult<Vec<String>> {
        if self.faults.keys.load(Ordering::SeqCst) {
            return Err(SwError::Storage("injected keys failure".to_string()));
        }
        self.inner.keys().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_serves_and_records() {
        let network = StubNetwork::new(Url::parse("https://folio.example/").unwrap());
        network.serve("/a.js", "a");

        let hit = network.fetch(&Request::get(network.url("/a.js"))).await.unwrap();
        assert_eq!(hit.status, 200);
        let miss = network.fetch(&Request::get(network.url("/b.js"))).await.unwrap();
        assert_eq!(miss.status, 404);

        assert_eq!(network.calls().len(), 2);
        assert_eq!(network.call_count("/a.js"), 1);
    }

    #[tokio::test]
    async fn test_stub_classifies_cross_origin() {
        let network = StubNetwork::new(Url::parse("https://folio.example/").unwrap());
        let font = Url::parse("https://fonts.example/inter.woff2").unwrap();
        network.serve_response(Response::new(font.clone(), 200, "woff"));

        let cors = network.fetch(&Request::get(font.clone())).await.unwrap();
        assert_eq!(cors.response_type, ResponseType::Cors);

        let opaque = network
            .fetch(&Request::get(font).with_mode(RequestMode::NoCors))
            .await
            .unwrap();
        assert_eq!(opaque.response_type, ResponseType::Opaque);
        assert_eq!(opaque.status, 0);
        assert!(opaque.body.is_empty());
    }

    #[tokio::test]
    async fn test_faulty_keys() {
        let storage = FaultyStorage::new();
        storage.fail_keys(true);
        assert!(storage.keys().await.is_err());
        storage.fail_keys(false);
        assert!(storage.keys().await.unwrap().is_empty());
    }
}
