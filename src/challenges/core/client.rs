//! Transport seam towards the upstream web application.
//!
//! Every upstream call made by the session layer (authentication exchange,
//! uploads, the streaming chat call, page probes) goes through
//! [`UpstreamHttpClient`], so the cookie jar and browser-like headers are
//! applied consistently and tests can substitute a scripted transport.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{StreamingResponse, UpstreamRequest, UpstreamResponse};

/// Contract that abstracts the HTTP transport used to reach the upstream.
///
/// Implementations must share one cookie store across calls so the session
/// behaves like a single browser tab.
#[async_trait]
pub trait UpstreamHttpClient: Send + Sync {
    /// Sends a request and buffers the whole response body.
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamClientError>;

    /// Sends a request and hands back the body as an incremental stream.
    async fn send_streaming(
        &self,
        request: UpstreamRequest,
    ) -> Result<StreamingResponse, UpstreamClientError>;
}

#[derive(Debug, Error)]
pub enum UpstreamClientError {
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("body stream interrupted: {0}")]
    Body(String),
}
