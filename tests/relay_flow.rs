use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arena_relay_rs::{
    ApiVersion, ApiVersionSetting, DisabledWidget, PendingEntry, PendingQueue, Relay, RelayConfig,
    SessionCookieJar, StateStore, StreamingResponse, UpstreamClientError, UpstreamHttpClient,
    UpstreamRequest, UpstreamResponse,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;

const STREAM: &str = "/nextjs-api/stream/create-evaluation";

const ORIGIN_PAGE: &str = r#"<!DOCTYPE html><html><head><title>LMArena</title></head>
<body><header>Arena</header><nav>menu</nav><main><textarea></textarea></main>
<script>self.__next_f.push([1,"{\"initialModels\":[{\"id\":\"m1\",\"publicName\":\"gpt-4o\"}]}"])</script>
</body></html>"#;

#[derive(Clone)]
struct Reply {
    status: u16,
    content_type: &'static str,
    chunks: Vec<&'static str>,
}

/// Upstream double answering by request path.
#[derive(Default)]
struct ScriptedUpstream {
    routes: Mutex<HashMap<&'static str, Reply>>,
    hits: Mutex<Vec<String>>,
}

impl ScriptedUpstream {
    fn route(&self, path: &'static str, status: u16, content_type: &'static str, chunks: &[&'static str]) {
        self.routes.lock().unwrap().insert(
            path,
            Reply {
                status,
                content_type,
                chunks: chunks.to_vec(),
            },
        );
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().iter().filter(|hit| *hit == path).count()
    }

    fn reply(&self, request: &UpstreamRequest) -> (Reply, HeaderMap) {
        self.hits.lock().unwrap().push(request.path().to_string());
        let reply = self
            .routes
            .lock()
            .unwrap()
            .get(request.path())
            .cloned()
            .unwrap_or(Reply {
                status: 404,
                content_type: "text/plain",
                chunks: vec!["not found"],
            });
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(reply.content_type));
        (reply, headers)
    }
}

#[async_trait]
impl UpstreamHttpClient for ScriptedUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamClientError> {
        let (reply, headers) = self.reply(&request);
        Ok(UpstreamResponse {
            status: reply.status,
            headers,
            body: Bytes::from(reply.chunks.concat()),
            url: request.url,
        })
    }

    async fn send_streaming(
        &self,
        request: UpstreamRequest,
    ) -> Result<StreamingResponse, UpstreamClientError> {
        let (reply, headers) = self.reply(&request);
        let chunks: Vec<Result<Bytes, UpstreamClientError>> = reply
            .chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        Ok(StreamingResponse {
            status: reply.status,
            headers,
            body: futures_util::stream::iter(chunks).boxed(),
        })
    }
}

struct Harness {
    listener: TcpListener,
    upstream: Arc<ScriptedUpstream>,
    jar: Arc<SessionCookieJar>,
    queue: PendingQueue,
    relay: Relay,
}

async fn harness() -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = RelayConfig {
        controller_url: format!("ws://{}", listener.local_addr().unwrap()),
        api_version: ApiVersionSetting::Pinned(ApiVersion::NextjsApi),
        reconnect_delay: Duration::from_millis(50),
        token_wait_timeout: Duration::from_millis(50),
        token_poll_interval: Duration::from_millis(10),
        challenge_wait_timeout: Duration::from_millis(500),
        challenge_poll_interval: Duration::from_millis(10),
        recovery_grace: Duration::from_millis(10),
        auth_wait_timeout: Duration::from_millis(50),
        replay_delay: Duration::from_millis(10),
        ..RelayConfig::default()
    };

    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.route("/", 200, "text/html; charset=utf-8", &[ORIGIN_PAGE]);
    let jar = Arc::new(SessionCookieJar::new());
    let store = StateStore::in_memory().unwrap();
    let relay = Relay::builder()
        .with_config(config)
        .with_upstream_client(upstream.clone())
        .with_cookie_jar(jar.clone())
        .with_state_store(store.clone())
        .with_widget(Arc::new(DisabledWidget))
        .build()
        .unwrap();

    Harness {
        listener,
        upstream,
        jar,
        queue: PendingQueue::new(store),
        relay,
    }
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (tcp, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("relay did not connect")
        .unwrap();
    accept_async(tcp).await.unwrap()
}

/// Next JSON frame, or `None` once the relay closed the socket.
async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Option<Value> {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame from relay")?
            .ok()?;
        match message {
            Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

fn pending(id: &str) -> PendingEntry {
    PendingEntry {
        request_id: id.to_string(),
        payload: json!({"messages": [{"role": "user", "content": "queued"}]}),
        files_to_upload: Vec::new(),
    }
}

#[tokio::test]
async fn streams_live_work_and_replays_queued_requests() {
    let h = harness().await;
    h.jar.insert("arena-auth-prod-v1", "base64-e30=", ".lmarena.ai");
    h.upstream.route(STREAM, 200, "text/plain", &["a0:\"Hel", "lo\"\n", "ad:{}\n"]);
    h.queue.push_if_absent(pending("queued-1")).unwrap();

    let shutdown = CancellationToken::new();
    let relay = h.relay;
    let run = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { relay.run(shutdown).await }
    });

    let mut ws = accept(&h.listener).await;
    let handshake = next_frame(&mut ws).await.unwrap();
    assert_eq!(handshake["type"], "reconnection_handshake");
    assert_eq!(handshake["pending_request_ids"], json!(["queued-1"]));

    ws.send(Message::text(
        json!({"request_id": "live-1", "payload": {"messages": [{"role": "user", "content": "hi"}]}})
            .to_string(),
    ))
    .await
    .unwrap();

    let mut per_request: HashMap<String, Vec<Value>> = HashMap::new();
    let mut registry = None;
    let mut finished = 0;
    while finished < 2 {
        let frame = next_frame(&mut ws).await.expect("relay closed early");
        if frame["type"] == "model_registry" {
            registry = Some(frame["models"].clone());
            continue;
        }
        let id = frame["request_id"].as_str().unwrap().to_string();
        if frame["data"] == "[DONE]" {
            finished += 1;
        }
        per_request.entry(id).or_default().push(frame["data"].clone());
    }

    let expected = vec![json!("a0:\"Hello\""), json!("ad:{}"), json!("[DONE]")];
    assert_eq!(per_request["live-1"], expected);
    assert_eq!(per_request["queued-1"], expected);
    assert_eq!(registry.unwrap()["gpt-4o"]["id"], "m1");
    assert!(h.queue.is_empty().unwrap());

    shutdown.cancel();
    timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn rate_limit_reloads_and_announces_the_request_again() {
    let h = harness().await;
    h.jar.insert("arena-auth-prod-v1", "base64-e30=", ".lmarena.ai");
    h.upstream.route(STREAM, 429, "text/plain", &["Too Many Requests"]);

    let shutdown = CancellationToken::new();
    let relay = h.relay;
    let run = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { relay.run(shutdown).await }
    });

    let mut first = accept(&h.listener).await;
    let handshake = next_frame(&mut first).await.unwrap();
    assert_eq!(handshake["pending_request_ids"], json!([]));
    first
        .send(Message::text(json!({"request_id": "r-429", "payload": {}}).to_string()))
        .await
        .unwrap();

    // No data frame for the rate-limited request before the reload.
    while let Some(frame) = next_frame(&mut first).await {
        assert_eq!(frame["type"], "model_registry", "unexpected frame {frame}");
    }
    assert!(h.jar.is_empty());

    let mut second = accept(&h.listener).await;
    let handshake = next_frame(&mut second).await.unwrap();
    assert_eq!(handshake["pending_request_ids"], json!(["r-429"]));

    // The replay cannot authenticate (cookies were discarded and no widget is
    // configured), so it fails permanently with an error frame.
    let mut replay = Vec::new();
    while replay.last() != Some(&json!("[DONE]")) {
        let frame = next_frame(&mut second).await.expect("relay closed early");
        if frame["request_id"] == "r-429" {
            replay.push(frame["data"].clone());
        }
    }
    assert_eq!(replay.len(), 2);
    assert!(replay[0]["error"].as_str().unwrap().contains("verification token"));
    assert!(h.queue.is_empty().unwrap());
    assert_eq!(h.upstream.hits(STREAM), 1);

    shutdown.cancel();
    timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
}
