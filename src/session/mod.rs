//! Session layer.
//!
//! A [`Session`] lives for one controller connection. It owns the pieces a
//! reload throws away (token source, reset guard, active executions) and
//! borrows the relay-wide [`RelayServices`] that survive it.

pub mod auth;
pub mod context;
pub mod endpoints;
pub mod executor;
pub mod recovery;
pub mod registry;
pub mod upload;

use std::sync::Arc;

use crate::challenges::core::{UpstreamHttpClient, UpstreamRequest};
use crate::challenges::detectors::ChallengeDetector;
use crate::challenges::solvers::{
    ReloadTrigger, ResetHandler, TokenSource, TokenSourceSettings, discover_site_key,
};
use crate::config::RelayConfig;
use crate::external_deps::captcha::TurnstileWidget;
use crate::modules::cookies::SessionCookieJar;
use crate::modules::events::EventDispatcher;
use crate::modules::state::{CredentialStore, PendingQueue, StoreError};
use crate::transport::{ControlFrame, FrameSender, InboundMessage, OutboundMessage, WorkItem};

pub use auth::{AuthError, AuthSettings, AuthenticationController, Readiness};
pub use context::{ExecutionGuard, SessionContext};
pub use endpoints::{ApiVersion, ApiVersionSetting, EndpointKind, Endpoints};
pub use executor::{ExecutionError, ExecutionOutcome, RequestExecutor};
pub use recovery::{RecoveryOrchestrator, RecoveryOutcome, RecoverySettings};
pub use registry::{PageRegistryExtractor, RegistrySource};
pub use upload::{Attachment, UploadError, UploadPipeline};

/// Relay-wide collaborators shared by every session.
pub struct RelayServices {
    pub config: Arc<RelayConfig>,
    pub client: Arc<dyn UpstreamHttpClient>,
    pub jar: Arc<SessionCookieJar>,
    pub queue: PendingQueue,
    pub credentials: CredentialStore,
    pub endpoints: Arc<Endpoints>,
    pub detector: Arc<ChallengeDetector>,
    pub widget: Arc<dyn TurnstileWidget>,
    pub registry: Arc<dyn RegistrySource>,
    pub events: Arc<EventDispatcher>,
}

impl RelayServices {
    /// Markup of the upstream origin page; `None` when it could not be
    /// fetched.
    pub async fn origin_page(&self) -> Option<String> {
        let request = UpstreamRequest::get(self.config.upstream_origin.clone())
            .with_header(http::header::ACCEPT, "text/html,application/xhtml+xml");
        match self.client.send(request).await {
            Ok(response) => Some(response.text()),
            Err(err) => {
                log::debug!("origin page fetch failed: {err}");
                None
            }
        }
    }
}

pub struct Session {
    services: Arc<RelayServices>,
    ctx: Arc<SessionContext>,
    tokens: TokenSource,
    auth: Arc<AuthenticationController>,
    executor: Arc<RequestExecutor>,
}

impl Session {
    pub fn new(services: Arc<RelayServices>, frames: FrameSender) -> Arc<Self> {
        let config = &services.config;
        let ctx = SessionContext::new(frames.clone());

        let tokens = TokenSource::new(
            services.widget.clone(),
            TokenSourceSettings {
                site_key: config.turnstile_site_key.clone(),
                action: config.turnstile_action.clone(),
                poll_interval: config.token_poll_interval,
                interaction_delay: config.widget_interaction_delay,
                recreate_delay: config.widget_recreate_delay,
            },
        );
        let auth = Arc::new(AuthenticationController::new(
            services.client.clone(),
            services.jar.clone(),
            services.credentials.clone(),
            tokens.clone(),
            services.endpoints.clone(),
            services.events.clone(),
            AuthSettings {
                origin: config.upstream_origin.clone(),
                auth_cookie: config.auth_cookie_name.clone(),
                provisional_cookie: config.provisional_cookie_name.clone(),
                token_wait_timeout: config.token_wait_timeout,
            },
        ));
        let trigger: Arc<dyn ReloadTrigger> = ctx.clone();
        let resets = Arc::new(ResetHandler::new(
            services.jar.clone(),
            services.credentials.clone(),
            config.upstream_origin.clone(),
            trigger,
            services.events.clone(),
        ));
        let executor = Arc::new(RequestExecutor::new(
            services.client.clone(),
            services.endpoints.clone(),
            auth.clone(),
            UploadPipeline::new(services.client.clone(), services.endpoints.clone()),
            services.detector.clone(),
            services.queue.clone(),
            resets,
            services.events.clone(),
            frames,
        ));

        Arc::new(Self {
            services,
            ctx,
            tokens,
            auth,
            executor,
        })
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn tokens(&self) -> &TokenSource {
        &self.tokens
    }

    pub fn auth(&self) -> &Arc<AuthenticationController> {
        &self.auth
    }

    /// Announces the ids still waiting in the pending queue.
    pub fn send_handshake(&self) -> Result<Vec<String>, StoreError> {
        let pending = self.services.queue.ids()?;
        self.ctx.frames().send(OutboundMessage::handshake(pending.clone()));
        Ok(pending)
    }

    /// Fetches the origin page once to learn the site key and publish the
    /// model registry.
    pub async fn prepare(&self) {
        let Some(markup) = self.services.origin_page().await else {
            return;
        };
        if let Some(site_key) = discover_site_key(&markup) {
            self.tokens.set_site_key(site_key);
        }
        self.publish_registry(&markup);
    }

    /// Re-reads the origin page and sends the registry again.
    pub async fn refresh_registry(&self) {
        match self.services.origin_page().await {
            Some(markup) => self.publish_registry(&markup),
            None => log::warn!("model refresh skipped; origin page unavailable"),
        }
    }

    fn publish_registry(&self, markup: &str) {
        match self.services.registry.extract(markup) {
            Some(models) => {
                log::info!("sending model registry with {} entries", models.len());
                self.ctx
                    .frames()
                    .send(OutboundMessage::Control(ControlFrame::ModelRegistry { models }));
            }
            None => log::debug!("origin page carries no model registry"),
        }
    }

    pub fn recovery(&self) -> RecoveryOrchestrator {
        let config = &self.services.config;
        RecoveryOrchestrator::new(
            self.services.clone(),
            self.auth.clone(),
            self.tokens.clone(),
            self.executor.clone(),
            self.ctx.clone(),
            RecoverySettings {
                challenge_timeout: config.challenge_wait_timeout,
                challenge_interval: config.challenge_poll_interval,
                grace: config.recovery_grace,
                auth_timeout: config.auth_wait_timeout,
                auth_interval: config.token_poll_interval,
                replay_delay: config.replay_delay,
            },
        )
    }

    /// Routes one inbound frame. Work items run on their own task.
    pub fn dispatch(self: &Arc<Self>, message: InboundMessage) {
        match message {
            InboundMessage::Ping { timestamp } => {
                self.ctx
                    .frames()
                    .send(OutboundMessage::Control(ControlFrame::Pong { timestamp }));
            }
            InboundMessage::RefreshModels => {
                let session = Arc::clone(self);
                tokio::spawn(async move { session.refresh_registry().await });
            }
            InboundMessage::ModelRegistryAck { count } => {
                log::info!("controller acknowledged {count} models");
            }
            InboundMessage::ReconnectionAck {
                message,
                pending_request_ids,
            } => {
                log::info!(
                    "controller acknowledged reconnection: {message} ({} pending)",
                    pending_request_ids.len()
                );
            }
            InboundMessage::RestorationAck {
                message,
                restored_count,
            } => {
                log::info!("controller restored {restored_count} request(s): {message}");
            }
            InboundMessage::AbortRequest { request_id } => {
                if self.ctx.abort(&request_id) {
                    log::info!("request {request_id} aborted by controller");
                } else {
                    log::debug!("abort for unknown request {request_id}");
                }
            }
            InboundMessage::Work(work) => self.spawn_work(work),
            InboundMessage::Unknown(kind) => log::debug!("ignoring unknown frame {kind}"),
        }
    }

    /// Registers the cancellation handle before any network activity, then
    /// runs the item on its own task.
    pub fn spawn_work(self: &Arc<Self>, work: WorkItem) {
        let guard = self.ctx.register(&work.request_id);
        let executor = self.executor.clone();
        tokio::spawn(async move {
            executor.run(work, guard).await;
        });
    }

    /// Ends the session: cancels every execution, stops background work
    /// and tears the widget down. Returns how many executions were active.
    pub fn close(&self) -> usize {
        let cancelled = self.ctx.cancel_all();
        self.ctx.stop();
        self.tokens.teardown();
        cancelled
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{CHALLENGE_PAGE, NORMAL_PAGE, services};
    use super::*;
    use crate::challenges::core::testing::{StubReply, StubUpstream};
    use crate::modules::state::PendingEntry;
    use crate::transport::{FileToUpload, FrameReceiver};
    use serde_json::json;

    const STREAM: &str = "/nextjs-api/stream/create-evaluation";

    fn drain(rx: &mut FrameReceiver) -> Vec<OutboundMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn entry(id: &str) -> PendingEntry {
        PendingEntry {
            request_id: id.into(),
            payload: json!({"messages": [{"role": "user", "content": id}]}),
            files_to_upload: Vec::<FileToUpload>::new(),
        }
    }

    fn authenticate(services: &RelayServices) {
        services.jar.insert("arena-auth-prod-v1", "base64-e30=", ".lmarena.ai");
    }

    #[tokio::test]
    async fn handshake_lists_queued_ids() {
        let services = services(StubUpstream::new());
        services.queue.push_if_absent(entry("a")).unwrap();
        services.queue.push_if_absent(entry("b")).unwrap();
        let (frames, mut rx) = FrameSender::channel();
        let session = Session::new(services, frames);

        assert_eq!(session.send_handshake().unwrap(), vec!["a".to_string(), "b".to_string()]);
        let text = drain(&mut rx)[0].to_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "reconnection_handshake");
        assert_eq!(value["pending_request_ids"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn prepare_learns_site_key_and_sends_registry() {
        let stub = StubUpstream::new();
        stub.route("/", StubReply::html(200, NORMAL_PAGE));
        let (frames, mut rx) = FrameSender::channel();
        let session = Session::new(services(stub), frames);

        session.prepare().await;
        assert_eq!(session.tokens().site_key().as_deref(), Some("0x4AAAAAAAtestsitekey"));
        match &drain(&mut rx)[..] {
            [OutboundMessage::Control(ControlFrame::ModelRegistry { models })] => {
                assert_eq!(models["gpt-4o"]["id"], "m1");
            }
            other => panic!("unexpected frames {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_is_answered_with_same_timestamp() {
        let (frames, mut rx) = FrameSender::channel();
        let session = Session::new(services(StubUpstream::new()), frames);
        session.dispatch(InboundMessage::Ping { timestamp: json!(1700000000123u64) });
        assert_eq!(
            drain(&mut rx),
            vec![OutboundMessage::Control(ControlFrame::Pong {
                timestamp: json!(1700000000123u64)
            })]
        );
    }

    #[tokio::test]
    async fn abort_cancels_the_registered_execution() {
        let (frames, mut rx) = FrameSender::channel();
        let session = Session::new(services(StubUpstream::new()), frames);

        let guard = session.context().register("r1");
        session.dispatch(InboundMessage::AbortRequest { request_id: "r1".into() });
        assert!(guard.is_cancelled());
        assert!(!session.context().is_active("r1"));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn work_item_streams_on_its_own_task() {
        let stub = StubUpstream::new();
        let services = services(stub.clone());
        authenticate(&services);
        stub.route(STREAM, StubReply::chunks(200, &["a0:\"hi\"\n"]));
        let (frames, mut rx) = FrameSender::channel();
        let session = Session::new(services, frames);

        session.dispatch(InboundMessage::Work(WorkItem {
            request_id: "w1".into(),
            payload: json!({"messages": []}),
            files_to_upload: Vec::new(),
        }));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first, OutboundMessage::line("w1", "a0:\"hi\""));
        assert!(second.is_done());
    }

    #[tokio::test]
    async fn recovery_replays_in_order_after_clearing_queue() {
        let stub = StubUpstream::new();
        let services = services(stub.clone());
        authenticate(&services);
        stub.route("/", StubReply::html(200, CHALLENGE_PAGE));
        stub.route("/", StubReply::html(200, NORMAL_PAGE));
        stub.route(STREAM, StubReply::chunks(200, &["a0:\"ok\"\n"]));
        services.queue.push_if_absent(entry("first")).unwrap();
        services.queue.push_if_absent(entry("second")).unwrap();

        let queue = services.queue.clone();
        let seen_while_streaming = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = seen_while_streaming.clone();
        stub.on_request(move |request| {
            if request.path() == STREAM {
                seen.lock().unwrap().push(queue.len().unwrap());
            }
        });

        let (frames, mut rx) = FrameSender::channel();
        let session = Session::new(services.clone(), frames);
        let outcome = session.recovery().run().await.unwrap();

        match outcome {
            RecoveryOutcome::Replayed { outcomes, requeued } => {
                let ids: Vec<_> = outcomes.iter().map(|(id, _)| id.as_str()).collect();
                assert_eq!(ids, vec!["first", "second"]);
                assert_eq!(requeued, 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(*seen_while_streaming.lock().unwrap(), vec![0, 0]);
        assert!(services.queue.is_empty().unwrap());

        let frames = drain(&mut rx);
        let order: Vec<_> = frames.iter().filter_map(|f| f.request_id()).collect();
        assert_eq!(order, vec!["first", "first", "second", "second"]);
        assert!(stub.requests_to("/").len() >= 2);
    }

    #[tokio::test]
    async fn recovery_leaves_queue_when_challenge_persists() {
        let stub = StubUpstream::new();
        let services = services(stub.clone());
        stub.route("/", StubReply::html(200, CHALLENGE_PAGE));
        services.queue.push_if_absent(entry("stuck")).unwrap();

        let (frames, _rx) = FrameSender::channel();
        let session = Session::new(services.clone(), frames);
        let outcome = session.recovery().run().await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::ChallengeTimeout { pending: 1 });
        assert_eq!(services.queue.ids().unwrap(), vec!["stuck".to_string()]);
        assert!(stub.requests_to(STREAM).is_empty());
    }

    #[tokio::test]
    async fn reload_during_replay_requeues_the_rest() {
        let stub = StubUpstream::new();
        let services = services(stub.clone());
        authenticate(&services);
        stub.route("/", StubReply::html(200, NORMAL_PAGE));
        stub.route(STREAM, StubReply::status(429, "slow down"));
        for id in ["one", "two", "three"] {
            services.queue.push_if_absent(entry(id)).unwrap();
        }

        let (frames, mut rx) = FrameSender::channel();
        let session = Session::new(services.clone(), frames);
        let outcome = session.recovery().run().await.unwrap();

        match outcome {
            RecoveryOutcome::Replayed { outcomes, requeued } => {
                assert_eq!(outcomes.len(), 1);
                assert_eq!(requeued, 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            services.queue.ids().unwrap(),
            vec!["one".to_string(), "two".to_string(), "three".to_string()]
        );
        assert!(session.context().is_stopping());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(stub.requests_to(STREAM).len(), 1);
    }

    #[tokio::test]
    async fn recovery_without_pending_is_a_no_op() {
        let stub = StubUpstream::new();
        let (frames, _rx) = FrameSender::channel();
        let session = Session::new(services(stub.clone()), frames);
        assert_eq!(session.recovery().run().await.unwrap(), RecoveryOutcome::NothingPending);
        assert!(stub.requests().is_empty());
    }
}
