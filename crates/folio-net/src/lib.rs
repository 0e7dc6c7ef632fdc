//! # Folio Net
//!
//! HTTP network for the Folio service worker.
//!
//! `HttpNetwork` performs the worker's real fetches with `reqwest` and tags
//! each response with the type a browser would give it relative to the
//! worker origin:
//!
//! - final URL same-origin: `basic`
//! - cross-origin, `no-cors` request: `opaque` (status 0, no headers, no body)
//! - cross-origin otherwise: `cors`

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use folio_sw::fetch::Headers;
use folio_sw::policy::same_origin;
use folio_sw::{Network, Request, RequestMode, Response, ResponseType, SwError, SwResult};
use http::StatusCode;
use reqwest::Client;
use tracing::{debug, info, trace};
use url::Url;

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Per-request timeout. `None` waits for the transport to give up.
    pub timeout: Option<Duration>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Folio/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            max_redirects: 10,
            timeout: None,
        }
    }
}

/// Network backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: Client,
    config: LoaderConfig,
    origin: Url,
}

impl HttpNetwork {
    /// Create a network for a worker serving `origin`.
    pub fn new(origin: Url, config: LoaderConfig) -> SwResult<Self> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| SwError::Network(e.to_string()))?;

        info!(origin = %origin, "HttpNetwork initialized");

        Ok(Self {
            client,
            config,
            origin,
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn classify(&self, request: &Request, final_url: &Url) -> ResponseType {
        if same_origin(final_url, &self.origin) {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }
}

fn without_fragment(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> SwResult<Response> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name.as_str(), value.as_str());
        }

        if !request.headers.contains_key("accept-language") {
            req_builder = req_builder.header("Accept-Language", &self.config.accept_language);
        }

        if let Some(body) = &request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| SwError::Network(e.to_string()))?;

        let status: StatusCode = response.status();
        let url = response.url().clone();
        let headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| SwError::Network(e.to_string()))?;

        let response_type = self.classify(request, &url);
        let redirected = without_fragment(&url) != without_fragment(&request.url);

        trace!(
            url = %url,
            status = %status,
            response_type = ?response_type,
            redirected,
            body_len = body.len(),
            "Response received"
        );

        let mut response = Response::new(url, status.as_u16(), body).with_type(response_type);
        response.redirected = redirected;

        if response_type == ResponseType::Opaque {
            response.status = 0;
            response.status_text.clear();
            response.body = Bytes::new();
        } else {
            response.status_text = status.canonical_reason().unwrap_or_default().to_string();
            response.headers = headers;
        }

        Ok(response)
    }
}
