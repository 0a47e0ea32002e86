//! Scripted upstream used by unit tests across the crate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use super::client::{UpstreamClientError, UpstreamHttpClient};
use super::types::{StreamingResponse, UpstreamRequest, UpstreamResponse};

#[derive(Debug, Clone)]
pub(crate) struct StubReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<String>,
    pub fail_after_chunks: Option<String>,
    /// Pause before each streamed chunk.
    pub chunk_delay: Option<Duration>,
}

impl StubReply {
    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            chunks: vec![body.to_string()],
            fail_after_chunks: None,
            chunk_delay: None,
        }
    }

    pub fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    pub fn html(status: u16, body: &str) -> Self {
        Self::status(status, body).with_header("content-type", "text/html; charset=utf-8")
    }

    pub fn chunks(status: u16, chunks: &[&str]) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
            fail_after_chunks: None,
            chunk_delay: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn failing_after(mut self, message: &str) -> Self {
        self.fail_after_chunks = Some(message.to_string());
        self
    }

    pub fn paced(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        if !map.contains_key(CONTENT_TYPE) {
            map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        map
    }
}

type RequestHook = Box<dyn Fn(&UpstreamRequest) + Send + Sync>;

/// Upstream double answering by exact request path. The last reply queued
/// for a path keeps being served once the others are consumed.
#[derive(Default)]
pub(crate) struct StubUpstream {
    routes: Mutex<HashMap<String, VecDeque<StubReply>>>,
    requests: Mutex<Vec<UpstreamRequest>>,
    hook: Mutex<Option<RequestHook>>,
}

impl StubUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, path: &str, reply: StubReply) {
        self.routes
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn on_request(&self, hook: impl Fn(&UpstreamRequest) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<UpstreamRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.url.path() == path)
            .collect()
    }

    fn next_reply(&self, request: &UpstreamRequest) -> StubReply {
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(request);
        }
        self.requests.lock().unwrap().push(request.clone());

        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(request.url.path()) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if queue.len() == 1 => queue.front().cloned().unwrap(),
            _ => StubReply::status(404, "not found"),
        }
    }
}

#[async_trait]
impl UpstreamHttpClient for StubUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamClientError> {
        let reply = self.next_reply(&request);
        if let Some(message) = reply.fail_after_chunks.clone() {
            return Err(UpstreamClientError::Transport(message));
        }
        Ok(UpstreamResponse {
            status: reply.status,
            headers: reply.header_map(),
            body: Bytes::from(reply.chunks.concat()),
            url: request.url,
        })
    }

    async fn send_streaming(
        &self,
        request: UpstreamRequest,
    ) -> Result<StreamingResponse, UpstreamClientError> {
        let reply = self.next_reply(&request);
        let mut items: Vec<Result<Bytes, UpstreamClientError>> = reply
            .chunks
            .iter()
            .map(|chunk| Ok(Bytes::from(chunk.clone())))
            .collect();
        if let Some(message) = reply.fail_after_chunks.clone() {
            items.push(Err(UpstreamClientError::Body(message)));
        }

        let body = futures_util::stream::iter(items);
        let body = match reply.chunk_delay {
            Some(delay) => body
                .then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    item
                })
                .boxed(),
            None => body.boxed(),
        };
        Ok(StreamingResponse {
            status: reply.status,
            headers: reply.header_map(),
            body,
        })
    }
}
