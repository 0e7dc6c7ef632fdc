//! Cache API: named buckets of request → response entries.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hashbrown::HashMap;
use http::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::fetch::{Headers, Request, Response, ResponseType};
use crate::{SwError, SwResult};

// ==================== Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (cache key).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers.
    pub headers: Headers,

    /// Response body.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,

    /// Response type at the time it was stored.
    pub response_type: ResponseType,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response for storage under the request's key.
    pub fn new(request: &Request, response: &Response) -> Self {
        Self {
            url: request.cache_key(),
            method: request.method.to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            body: response.body.to_vec(),
            response_type: response.response_type,
            cached_at: now_millis(),
        }
    }

    /// Approximate stored size in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
            + self.url.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Reject anything the Cache API refuses to store.
pub(crate) fn check_put(request: &Request) -> SwResult<()> {
    if request.method != Method::GET {
        return Err(SwError::InvalidRequest(format!(
            "cannot cache {} {}",
            request.method, request.url
        )));
    }
    Ok(())
}

// ==================== Traits ====================

/// A single named cache bucket.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Bucket name.
    fn name(&self) -> &str;

    /// Look up the entry stored for a request.
    async fn match_request(&self, request: &Request) -> SwResult<Option<CacheEntry>>;

    /// Store a response for a GET request, replacing any previous entry.
    async fn put(&self, request: &Request, response: &Response) -> SwResult<()>;

    /// Remove the entry for a request.
    async fn delete(&self, request: &Request) -> SwResult<bool>;

    /// Keys (URLs) of all entries.
    async fn keys(&self) -> SwResult<Vec<String>>;
}

/// The set of named buckets for an origin (the `caches` global).
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a bucket, creating it if absent.
    async fn open(&self, name: &str) -> SwResult<Arc<dyn Cache>>;

    /// Check if a bucket exists.
    async fn has(&self, name: &str) -> SwResult<bool>;

    /// Delete a bucket and all its entries.
    async fn delete(&self, name: &str) -> SwResult<bool>;

    /// Names of all buckets.
    async fn keys(&self) -> SwResult<Vec<String>>;
}

// ==================== Memory Storage ====================

#[derive(Debug)]
struct Quota {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl Quota {
    /// Account for replacing `old` bytes with `new` bytes.
    fn reserve(&self, old: usize, new: usize) -> SwResult<()> {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            let next = used.saturating_sub(old) + new;
            if let Some(limit) = self.limit {
                if next > limit {
                    return Err(SwError::QuotaExceeded {
                        needed: new,
                        available: limit.saturating_sub(used.saturating_sub(old)),
                    });
                }
            }
            match self
                .used
                .compare_exchange(used, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => used = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

/// An in-memory cache bucket.
#[derive(Debug)]
pub struct MemoryCache {
    name: String,
    entries: RwLock<HashMap<String, CacheEntry>>,
    quota: Arc<Quota>,
    /// Set once the bucket is deleted from storage; its bytes no longer count.
    detached: AtomicBool,
}

impl MemoryCache {
    fn new(name: &str, quota: Arc<Quota>) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
            quota,
            detached: AtomicBool::new(false),
        }
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Mark the bucket deleted and return the bytes it was charged for.
    async fn detach(&self) -> usize {
        let entries = self.entries.write().await;
        self.detached.store(true, Ordering::Release);
        entries.values().map(CacheEntry::size).sum()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> SwResult<Option<CacheEntry>> {
        if request.method != Method::GET {
            return Ok(None);
        }
        Ok(self.entries.read().await.get(&request.cache_key()).cloned())
    }

    async fn put(&self, request: &Request, response: &Response) -> SwResult<()> {
        check_put(request)?;
        let entry = CacheEntry::new(request, response);

        let mut entries = self.entries.write().await;
        if !self.detached.load(Ordering::Acquire) {
            let old = entries.get(&entry.url).map(CacheEntry::size).unwrap_or(0);
            self.quota.reserve(old, entry.size())?;
        }

        trace!(cache = %self.name, url = %entry.url, "Stored entry");
        entries.insert(entry.url.clone(), entry);
        Ok(())
    }

    async fn delete(&self, request: &Request) -> SwResult<bool> {
        let removed = self.entries.write().await.remove(&request.cache_key());
        if let Some(entry) = &removed {
            if !self.detached.load(Ordering::Acquire) {
                self.quota.release(entry.size());
            }
        }
        Ok(removed.is_some())
    }

    async fn keys(&self) -> SwResult<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// In-memory cache storage with an optional byte quota across all buckets.
#[derive(Debug)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
    quota: Arc<Quota>,
}

impl Default for MemoryCacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheStorage {
    /// Create new cache storage without a quota.
    pub fn new() -> Self {
        Self::with_quota(None)
    }

    /// Create new cache storage limited to `quota_bytes` across all buckets.
    pub fn with_quota(quota_bytes: Option<usize>) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            quota: Arc::new(Quota {
                limit: quota_bytes,
                used: AtomicUsize::new(0),
            }),
        }
    }

    /// Bytes currently counted against the quota.
    pub fn used_bytes(&self) -> usize {
        self.quota.used.load(Ordering::Acquire)
    }

    /// Get a bucket without creating it.
    pub async fn get(&self, name: &str) -> Option<Arc<MemoryCache>> {
        self.caches.read().await.get(name).cloned()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> SwResult<Arc<dyn Cache>> {
        let mut caches = self.caches.write().await;
        let cache: Arc<dyn Cache> = caches
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(cache = %name, "Created cache");
                Arc::new(MemoryCache::new(name, Arc::clone(&self.quota)))
            })
            .clone();
        Ok(cache)
    }

    async fn has(&self, name: &str) -> SwResult<bool> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> SwResult<bool> {
        let removed = self.caches.write().await.remove(name);
        match removed {
            Some(cache) => {
                self.quota.release(cache.detach().await);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> SwResult<Vec<String>> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
