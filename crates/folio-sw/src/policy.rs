//! Routing and cacheability rules for intercepted requests.

use http::Method;
use url::Url;

use crate::fetch::{Request, Response, ResponseType};

/// What the worker does with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Leave the request to the browser.
    Passthrough(PassthroughReason),
    /// Answer the request from cache or network.
    Intercept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    NonGet,
    CrossOrigin,
}

/// Whether `url` shares scheme, host and port with `origin`.
pub fn same_origin(url: &Url, origin: &Url) -> bool {
    url.origin() == origin.origin()
}

/// Only same-origin GET requests are intercepted.
pub fn route(request: &Request, origin: &Url) -> Route {
    if request.method != Method::GET {
        Route::Passthrough(PassthroughReason::NonGet)
    } else if !same_origin(&request.url, origin) {
        Route::Passthrough(PassthroughReason::CrossOrigin)
    } else {
        Route::Intercept
    }
}

/// Whether a network response may be written to the bucket.
///
/// Requires a same-origin GET, status 200, and a basic response whose final
/// URL is still same-origin.
pub fn is_cacheable(request: &Request, response: &Response, origin: &Url) -> bool {
    request.method == Method::GET
        && same_origin(&request.url, origin)
        && response.status == 200
        && response.response_type == ResponseType::Basic
        && same_origin(&response.url, origin)
}
