//! Request and response model seen by the worker.

use std::borrow::Cow;

use bytes::Bytes;
use hashbrown::HashMap;
use http::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::CacheEntry;

/// Header map keyed by lowercase header name.
pub type Headers = HashMap<String, String>;

/// Request mode, as set by the page that issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RequestMode {
    /// Top-level document navigation.
    Navigate,
    /// Same-origin sub-resource.
    #[default]
    SameOrigin,
    /// Cross-origin without CORS; yields opaque responses.
    NoCors,
    /// Cross-origin with CORS.
    Cors,
}

/// Response type, describing how much of the response the page may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response allowed by CORS.
    Cors,
    /// Cross-origin no-cors response; status and body are hidden.
    Opaque,
    /// Network error.
    Error,
}

// ==================== Request ====================

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub mode: RequestMode,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a request with the given method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            mode: RequestMode::default(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Create a same-origin GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).with_mode(RequestMode::Navigate)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(body);
        request
    }

    /// Set the request mode.
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Whether this request loads a document.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
            || self
                .headers
                .get("accept")
                .is_some_and(|accept| accept.contains("text/html"))
    }

    /// Cache key: the URL without its fragment.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.into()
    }
}

// ==================== Response ====================

/// A response, either from the network, the cache, or synthesized.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Bytes,
    pub response_type: ResponseType,
    pub redirected: bool,
    pub from_cache: bool,
}

impl Response {
    /// Create a basic response.
    pub fn new(url: Url, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            status_text: default_status_text(status).to_string(),
            headers: Headers::new(),
            body: body.into(),
            response_type: ResponseType::Basic,
            redirected: false,
            from_cache: false,
        }
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Synthesized response for a request nothing could answer.
    pub fn not_found(url: Url) -> Self {
        Self::new(url, 404, "Offline: this page is not available without a connection.")
            .with_header("content-type", "text/plain; charset=utf-8")
    }

    /// Rebuild a response from a stored entry.
    pub fn from_entry(url: Url, entry: &CacheEntry) -> Self {
        Self {
            url,
            status: entry.status,
            status_text: entry.status_text.clone(),
            headers: entry.headers.clone(),
            body: Bytes::from(entry.body.clone()),
            response_type: entry.response_type,
            redirected: false,
            from_cache: true,
        }
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Approximate stored size in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
            + self.url.as_str().len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

fn default_status_text(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}
