//! Directory-backed cache storage.
//!
//! Each bucket is a single JSON file `<root>/<percent-encoded name>.json`
//! holding a key → entry map. Writes replace the file through a temp file and
//! a rename, so a reader never sees a half-written bucket.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use http::Method;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::cache::{check_put, Cache, CacheEntry, CacheStorage};
use crate::fetch::{Request, Response};
use crate::SwResult;

const BUCKET_EXT: &str = "json";

type Entries = HashMap<String, CacheEntry>;

/// A bucket stored as one JSON file.
#[derive(Debug)]
pub struct DiskCache {
    name: String,
    path: PathBuf,
    /// Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
    /// Set once the bucket is deleted; later writes are dropped.
    detached: AtomicBool,
}

impl DiskCache {
    fn new(name: &str, path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            path,
            lock: Mutex::new(()),
            detached: AtomicBool::new(false),
        }
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    async fn load(&self) -> SwResult<Entries> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Entries::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Entries::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, entries: &Entries) -> SwResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Cache for DiskCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> SwResult<Option<CacheEntry>> {
        if request.method != Method::GET {
            return Ok(None);
        }
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(&request.cache_key()))
    }

    async fn put(&self, request: &Request, response: &Response) -> SwResult<()> {
        check_put(request)?;
        let entry = CacheEntry::new(request, response);

        let _guard = self.lock.lock().await;
        if self.is_detached() {
            trace!(cache = %self.name, url = %entry.url, "Bucket deleted; dropping write");
            return Ok(());
        }
        let mut entries = self.load().await?;
        trace!(cache = %self.name, url = %entry.url, "Stored entry");
        entries.insert(entry.url.clone(), entry);
        self.store(&entries).await
    }

    async fn delete(&self, request: &Request) -> SwResult<bool> {
        let _guard = self.lock.lock().await;
        if self.is_detached() {
            return Ok(false);
        }
        let mut entries = self.load().await?;
        let removed = entries.remove(&request.cache_key()).is_some();
        if removed {
            self.store(&entries).await?;
        }
        Ok(removed)
    }

    async fn keys(&self) -> SwResult<Vec<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_keys().collect())
    }
}

/// Cache storage persisted under a root directory.
#[derive(Debug)]
pub struct DiskCacheStorage {
    root: PathBuf,
    /// Open buckets, so every handle to one bucket shares its lock.
    handles: Mutex<HashMap<String, Arc<DiskCache>>>,
}

impl DiskCacheStorage {
    /// Create storage rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> SwResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Disk cache storage ready");
        Ok(Self {
            root,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", urlencoding::encode(name), BUCKET_EXT))
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> SwResult<Arc<dyn Cache>> {
        let mut handles = self.handles.lock().await;
        if let Some(cache) = handles.get(name) {
            let cache: Arc<dyn Cache> = cache.clone();
            return Ok(cache);
        }

        let path = self.bucket_path(name);
        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::write(&path, b"{}").await?;
            debug!(cache = %name, "Created cache");
        }

        let cache = Arc::new(DiskCache::new(name, path));
        handles.insert(name.to_string(), Arc::clone(&cache));
        let cache: Arc<dyn Cache> = cache;
        Ok(cache)
    }

    async fn has(&self, name: &str) -> SwResult<bool> {
        Ok(tokio::fs::metadata(self.bucket_path(name)).await.is_ok())
    }

    async fn delete(&self, name: &str) -> SwResult<bool> {
        let mut handles = self.handles.lock().await;
        let path = self.bucket_path(name);

        // Wait for in-flight writes on this bucket before removing the file.
        let handle = handles.remove(name);
        let _guard = match &handle {
            Some(cache) => {
                let guard = cache.lock.lock().await;
                cache.detached.store(true, Ordering::Release);
                Some(guard)
            }
            None => None,
        };

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> SwResult<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BUCKET_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(name) = urlencoding::decode(stem) {
                names.push(name.into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("folio-disk-{}-{}", tag, std::process::id()))
    }

    fn request(path: &str) -> Request {
        Request::get(Url::parse("https://folio.example/").unwrap().join(path).unwrap())
    }

    fn response(path: &str, body: &'static str) -> Response {
        Response::new(
            Url::parse("https://folio.example/").unwrap().join(path).unwrap(),
            200,
            body,
        )
        .with_header("content-type", "text/css")
    }

    #[tokio::test]
    async fn test_open_twice_returns_shared_handle() {
        let root = temp_root("shared");
        let storage = DiskCacheStorage::new(&root).await.unwrap();

        let first = storage.open("portfolio-cache-v1").await.unwrap();
        let second = storage.open("portfolio-cache-v1").await.unwrap();
        first
            .put(&request("/script.js"), &response("/script.js", "run()"))
            .await
            .unwrap();

        let entry = second.match_request(&request("/script.js")).await.unwrap().unwrap();
        assert_eq!(entry.body, b"run()");
        assert_eq!(second.name(), "portfolio-cache-v1");

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_match_survives_reopen() {
        let root = temp_root("reopen");
        {
            let storage = DiskCacheStorage::new(&root).await.unwrap();
            let cache = storage.open("portfolio-cache-v1").await.unwrap();
            cache
                .put(&request("/styles.css"), &response("/styles.css", "body{}"))
                .await
                .unwrap();
        }

        let storage = DiskCacheStorage::new(&root).await.unwrap();
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["portfolio-cache-v1".to_string()]
        );
        let cache = storage.open("portfolio-cache-v1").await.unwrap();
        let entry = cache.match_request(&request("/styles.css")).await.unwrap().unwrap();
        assert_eq!(entry.body, b"body{}");
        assert_eq!(entry.headers.get("content-type").map(String::as_str), Some("text/css"));

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_bucket_names_are_encoded() {
        let root = temp_root("names");
        let storage = DiskCacheStorage::new(&root).await.unwrap();
        storage.open("weird/name v2").await.unwrap();

        assert!(storage.has("weird/name v2").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["weird/name v2".to_string()]);

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_bucket() {
        let root = temp_root("delete");
        let storage = DiskCacheStorage::new(&root).await.unwrap();
        storage.open("v1").await.unwrap();
        storage.open("v2").await.unwrap();

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["v2".to_string()]);

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_after_delete_does_not_recreate() {
        let root = temp_root("late-write");
        let storage = DiskCacheStorage::new(&root).await.unwrap();
        let stale = storage.open("v1").await.unwrap();

        storage.delete("v1").await.unwrap();
        stale
            .put(&request("/styles.css"), &response("/styles.css", "body{}"))
            .await
            .unwrap();

        assert!(!storage.has("v1").await.unwrap());
        assert!(storage.keys().await.unwrap().is_empty());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_puts_are_not_lost() {
        let root = temp_root("concurrent");
        let storage = DiskCacheStorage::new(&root).await.unwrap();
        let first = storage.open("v1").await.unwrap();
        let second = storage.open("v1").await.unwrap();

        let paths: Vec<String> = (0..8).map(|i| format!("/asset-{}.js", i)).collect();
        let puts = paths.iter().enumerate().map(|(i, path)| {
            let cache = if i % 2 == 0 { first.clone() } else { second.clone() };
            let req = request(path);
            let resp = response(path, "x");
            async move { cache.put(&req, &resp).await }
        });
        for result in futures::future::join_all(puts).await {
            result.unwrap();
        }

        assert_eq!(first.keys().await.unwrap().len(), paths.len());
        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_post_is_never_stored() {
        let root = temp_root("post");
        let storage = DiskCacheStorage::new(&root).await.unwrap();
        let cache = storage.open("v1").await.unwrap();
        let post = Request::post(
            Url::parse("https://folio.example/contact").unwrap(),
            bytes::Bytes::from_static(b"x"),
        );

        assert!(cache.put(&post, &response("/contact", "ok")).await.is_err());
        assert!(cache.keys().await.unwrap().is_empty());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
