//! Network seam used by the worker.

use async_trait::async_trait;

use crate::fetch::{Request, Response};
use crate::SwResult;

/// Performs real network fetches on behalf of the worker.
///
/// Implementations classify the response type against the worker origin and
/// report transport failures (offline, DNS, refused) as `SwError::Network`.
/// HTTP error statuses are responses, not errors.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> SwResult<Response>;
}
