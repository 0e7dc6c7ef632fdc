//! Worker configuration
//!
//! Everything the offline worker needs to know at startup lives here: the
//! origin it serves, the cache version, the precache manifest, and the policy
//! switches. The value is built once and handed to the worker; nothing reads
//! global state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{FolioError, FolioResult};

/// Assets fetched into the cache when a worker installs.
const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/index.html",
    "/about-page.html",
    "/projects.html",
    "/contact-us.html",
    "/text-game.html",
    "/star-wars-quiz.html",
    "/game-review.html",
    "/cipher.html",
    "/styles.css",
    "/scripts.js",
    "/images/background.jpg",
    "/images/background-small.jpg",
    "/images/background-medium.jpg",
    "/images/Net-design.png",
    "/images/castle-icon.png",
    "/images/castle-icon-small.png",
];

/// Offline worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker is registered for
    pub origin: Url,

    /// Cache name prefix; the version is appended
    pub cache_prefix: String,

    /// Cache version, bumped on every deploy
    pub version: u32,

    /// Root-relative URLs fetched at install time
    pub precache: Vec<String>,

    /// Page served to navigations when both network and cache miss
    pub offline_page: Option<String>,

    /// Add the offline page to the precache manifest
    pub precache_offline_page: bool,

    /// Refresh cache hits from the network in the background
    pub revalidate_on_hit: bool,

    /// Activate right after install instead of waiting for pages to close
    pub skip_waiting: bool,

    /// Take control of already-open pages on activation
    pub claim_clients: bool,

    /// Background sync tag the worker answers
    pub sync_tag: String,

    /// Push notification settings
    pub notification: NotificationConfig,

    /// Cache storage settings
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Notification title
    pub title: String,

    /// Icon path
    pub icon: String,

    /// Badge path
    pub badge: String,

    /// Page opened when a notification is clicked
    pub click_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Buckets live in memory for the lifetime of the process
    #[default]
    Memory,
    /// Buckets are JSON files under `StorageConfig::dir`
    Disk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend
    pub backend: StorageBackend,

    /// Directory for the disk backend
    pub dir: PathBuf,

    /// Byte quota across all buckets (memory backend)
    pub quota_bytes: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:8080/").expect("static origin is valid"),
            cache_prefix: "portfolio-cache".to_string(),
            version: 1,
            precache: DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect(),
            offline_page: Some("/offline.html".to_string()),
            precache_offline_page: true,
            revalidate_on_hit: true,
            skip_waiting: true,
            claim_clients: true,
            sync_tag: "sync-data".to_string(),
            notification: NotificationConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Portfolio Update".to_string(),
            icon: "/images/icon.png".to_string(),
            badge: "/images/badge.png".to_string(),
            click_url: "/".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("folio")
                .join("caches"),
            quota_bytes: None,
        }
    }
}

impl WorkerConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> FolioResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Parse and validate a JSON config; missing fields take their defaults
    pub fn from_json_str(contents: &str) -> FolioResult<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Same config with another cache version
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Same config with another origin
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = origin;
        self
    }

    /// Name of the bucket owned by this version
    pub fn cache_name(&self) -> String {
        format!("{}-v{}", self.cache_prefix, self.version)
    }

    /// Precache list with the offline page appended when configured.
    pub fn precache_manifest(&self) -> Vec<String> {
        let mut manifest = self.precache.clone();
        if self.precache_offline_page {
            if let Some(page) = &self.offline_page {
                if !manifest.contains(page) {
                    manifest.push(page.clone());
                }
            }
        }
        manifest
    }

    pub fn validate(&self) -> FolioResult<()> {
        if self.cache_prefix.trim().is_empty() {
            return Err(FolioError::config("cache_prefix must not be empty"));
        }

        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(FolioError::config(format!(
                "origin must be http or https, got {}",
                self.origin
            )));
        }

        let relative = self
            .precache
            .iter()
            .chain(self.offline_page.iter())
            .chain(std::iter::once(&self.notification.click_url));
        for path in relative {
            if !path.starts_with('/') || path.starts_with("//") {
                return Err(FolioError::config(format!(
                    "expected a root-relative path, got {:?}",
                    path
                )));
            }
        }

        Ok(())
    }
}
