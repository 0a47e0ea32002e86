//! Reqwest-based implementation of the `UpstreamHttpClient` trait.
//!
//! Provides a thin adapter around `reqwest::Client` wired to the relay's
//! [`SessionCookieJar`] so every upstream call carries the same browser
//! identity.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::client::{UpstreamClientError, UpstreamHttpClient};
use super::types::{StreamingResponse, UpstreamRequest, UpstreamResponse};
use crate::modules::cookies::SessionCookieJar;

/// Reqwest-backed HTTP client used for every upstream exchange.
pub struct ReqwestUpstreamClient {
    client: Client,
}

impl ReqwestUpstreamClient {
    /// Creates a client that stores cookies in `jar` and sends
    /// `default_headers` with every request.
    pub fn new(
        jar: Arc<SessionCookieJar>,
        default_headers: &[(String, String)],
    ) -> Result<Self, UpstreamClientError> {
        let client = Client::builder()
            .cookie_provider(jar)
            .default_headers(convert_headers(default_headers)?)
            .build()
            .map_err(|err| UpstreamClientError::Transport(err.to_string()))?;

        Ok(Self { client })
    }

    /// Wrap an existing reqwest client. The client should already carry the
    /// relay cookie jar; otherwise authentication state is lost between calls.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn dispatch(
        &self,
        request: UpstreamRequest,
    ) -> Result<reqwest::Response, UpstreamClientError> {
        let mut builder = self
            .client
            .request(request.method, request.url.as_str())
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        builder
            .send()
            .await
            .map_err(|err| UpstreamClientError::Transport(err.to_string()))
    }
}

#[async_trait]
impl UpstreamHttpClient for ReqwestUpstreamClient {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamClientError> {
        let response = self.dispatch(request).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| UpstreamClientError::Body(err.to_string()))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            url,
        })
    }

    async fn send_streaming(
        &self,
        request: UpstreamRequest,
    ) -> Result<StreamingResponse, UpstreamClientError> {
        let response = self.dispatch(request).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| UpstreamClientError::Body(err.to_string())))
            .boxed();

        Ok(StreamingResponse {
            status,
            headers,
            body,
        })
    }
}

fn convert_headers(headers: &[(String, String)]) -> Result<HeaderMap, UpstreamClientError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| UpstreamClientError::Transport(err.to_string()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| UpstreamClientError::Transport(err.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}
