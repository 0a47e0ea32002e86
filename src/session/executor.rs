//! Request executor.
//!
//! Runs one work item against the upstream streaming endpoint and forwards
//! its output, line by line, to the controller. Rate limits and challenge
//! pages are not reported: the item is queued and the session reset instead,
//! so the same request id is replayed after the reload.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use thiserror::Error;

use crate::challenges::core::{
    LineBuffer, MarkupSniffer, UpstreamClientError, UpstreamHttpClient, UpstreamRequest,
    Utf8ChunkDecoder,
};
use crate::challenges::detectors::ChallengeDetector;
use crate::challenges::solvers::{ResetHandler, ResetKind};
use crate::modules::events::{DistressEvent, EventDispatcher, RelayEvent, RequestEvent};
use crate::modules::state::{PendingEntry, PendingQueue, StoreError};
use crate::transport::{FrameSender, WorkItem};

use super::auth::{AuthError, AuthenticationController};
use super::context::ExecutionGuard;
use super::endpoints::{EndpointError, EndpointKind, Endpoints};
use super::upload::{UploadError, UploadPipeline, inject_attachments};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("timed out waiting for a verification token")]
    AuthTimeout,
    #[error("credential exchange failed with status {0}")]
    AuthExchangeFailed(u16),
    #[error("upload sign response could not be decoded")]
    UploadResponseUnparseable,
    #[error("file upload failed with status {0}")]
    UploadFailed(u16),
    #[error("upload notify response did not contain a file URL")]
    NotifyResponseMalformed,
    #[error("upstream returned {status}: {body}")]
    UpstreamError { status: u16, body: String },
    #[error("upstream rate limit")]
    RateLimited,
    #[error("upstream served a challenge page")]
    ChallengeDetected,
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid attachment: {0}")]
    InvalidAttachment(String),
    #[error(transparent)]
    Transport(#[from] UpstreamClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

impl ExecutionError {
    /// Recovered through queue-and-reset rather than reported.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExecutionError::RateLimited | ExecutionError::ChallengeDetected)
    }

    fn reset_kind(&self) -> Option<ResetKind> {
        match self {
            ExecutionError::RateLimited => Some(ResetKind::Identity),
            ExecutionError::ChallengeDetected => Some(ResetKind::Challenge),
            _ => None,
        }
    }
}

impl From<AuthError> for ExecutionError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Timeout => ExecutionError::AuthTimeout,
            AuthError::ExchangeFailed { status, .. } => ExecutionError::AuthExchangeFailed(status),
            AuthError::Transport(err) => ExecutionError::Transport(err),
            AuthError::Store(err) => ExecutionError::Store(err),
            AuthError::Endpoint(err) => ExecutionError::Endpoint(err),
        }
    }
}

impl From<UploadError> for ExecutionError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::ResponseUnparseable => ExecutionError::UploadResponseUnparseable,
            UploadError::Failed(status) => ExecutionError::UploadFailed(status),
            UploadError::NotifyMalformed => ExecutionError::NotifyResponseMalformed,
            UploadError::RateLimited => ExecutionError::RateLimited,
            UploadError::InvalidData { name, source } => {
                ExecutionError::InvalidAttachment(format!("{name}: {source}"))
            }
            UploadError::Transport(err) => ExecutionError::Transport(err),
            UploadError::Endpoint(err) => ExecutionError::Endpoint(err),
        }
    }
}

/// How an execution ended, as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Stream forwarded and terminated with the sentinel.
    Completed,
    /// Error frame and sentinel sent.
    Failed(String),
    /// Queued for replay; a reset was requested.
    Deferred(ResetKind),
    /// Stopped silently.
    Cancelled,
}

pub struct RequestExecutor {
    client: Arc<dyn UpstreamHttpClient>,
    endpoints: Arc<Endpoints>,
    auth: Arc<AuthenticationController>,
    uploads: UploadPipeline,
    detector: Arc<ChallengeDetector>,
    queue: PendingQueue,
    resets: Arc<ResetHandler>,
    events: Arc<EventDispatcher>,
    frames: FrameSender,
}

impl RequestExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn UpstreamHttpClient>,
        endpoints: Arc<Endpoints>,
        auth: Arc<AuthenticationController>,
        uploads: UploadPipeline,
        detector: Arc<ChallengeDetector>,
        queue: PendingQueue,
        resets: Arc<ResetHandler>,
        events: Arc<EventDispatcher>,
        frames: FrameSender,
    ) -> Self {
        Self {
            client,
            endpoints,
            auth,
            uploads,
            detector,
            queue,
            resets,
            events,
            frames,
        }
    }

    /// Executes a freshly received work item.
    pub async fn run(&self, work: WorkItem, guard: ExecutionGuard) -> ExecutionOutcome {
        self.drive(work, guard, false).await
    }

    /// Executes an entry restored from the pending queue.
    pub async fn replay(&self, entry: PendingEntry, guard: ExecutionGuard) -> ExecutionOutcome {
        self.drive(entry.into(), guard, true).await
    }

    async fn drive(&self, work: WorkItem, guard: ExecutionGuard, replay: bool) -> ExecutionOutcome {
        let started = Instant::now();
        let request_id = work.request_id.clone();
        self.events.dispatch(RelayEvent::RequestStarted(RequestEvent {
            request_id: request_id.clone(),
            replay,
            outcome: None,
            latency: None,
            timestamp: Utc::now(),
        }));

        let cancel = guard.token().clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            result = self.execute(&work, &guard) => result,
        };

        let outcome = match result {
            Ok(()) if guard.is_cancelled() => ExecutionOutcome::Cancelled,
            Ok(()) => {
                self.frames.done(&request_id);
                ExecutionOutcome::Completed
            }
            Err(ExecutionError::Cancelled) => {
                log::debug!("request {request_id} cancelled");
                ExecutionOutcome::Cancelled
            }
            Err(err) => match err.reset_kind() {
                Some(kind) => self.defer(&work, kind),
                None if guard.is_cancelled() => ExecutionOutcome::Cancelled,
                None => {
                    log::warn!("request {request_id} failed: {err}");
                    let message = err.to_string();
                    self.frames.fail(&request_id, message.clone());
                    ExecutionOutcome::Failed(message)
                }
            },
        };

        self.events.dispatch(RelayEvent::RequestFinished(RequestEvent {
            request_id,
            replay,
            outcome: Some(format!("{outcome:?}")),
            latency: Some(started.elapsed()),
            timestamp: Utc::now(),
        }));
        drop(guard);
        outcome
    }

    /// Queues `work` for replay and escalates to the matching reset.
    fn defer(&self, work: &WorkItem, kind: ResetKind) -> ExecutionOutcome {
        let queued = match self.queue.push_if_absent(PendingEntry::from(work)) {
            Ok(added) => added,
            Err(err) => {
                log::error!("failed to queue request {}: {err}", work.request_id);
                false
            }
        };
        self.events.dispatch(RelayEvent::Distress(DistressEvent {
            request_id: work.request_id.clone(),
            kind,
            queued,
            timestamp: Utc::now(),
        }));
        self.resets.reset(kind);
        ExecutionOutcome::Deferred(kind)
    }

    async fn execute(&self, work: &WorkItem, guard: &ExecutionGuard) -> Result<(), ExecutionError> {
        let request_id = work.request_id.as_str();

        let mut payload = work.payload.clone();
        if !work.files_to_upload.is_empty() {
            let attachments = self.uploads.upload_all(&work.files_to_upload).await?;
            if !inject_attachments(&mut payload, &attachments) {
                log::warn!("request {request_id} has no user message to attach files to");
            }
        }

        self.auth.ensure_ready(request_id).await?;

        let url = self.endpoints.url(EndpointKind::Stream).await?;
        let response = self
            .client
            .send_streaming(UpstreamRequest::post(url).with_json(&payload))
            .await?;

        if response.status == 429 {
            return Err(ExecutionError::RateLimited);
        }
        if !response.is_success() || response.is_html() {
            let status = response.status;
            let body = response.read_to_string().await?;
            if self.detector.is_challenge_text(&body) {
                return Err(ExecutionError::ChallengeDetected);
            }
            return Err(ExecutionError::UpstreamError { status, body });
        }

        let mut body = response.body;
        let mut decoder = Utf8ChunkDecoder::new();
        let mut lines = LineBuffer::new();
        let mut sniffer = MarkupSniffer::new();
        while let Some(chunk) = body.next().await {
            let text = decoder.decode(&chunk?);
            self.check_markup(request_id, &mut sniffer, &text)?;
            self.forward(request_id, lines.push(&text), guard);
        }

        let tail = decoder.finish();
        self.check_markup(request_id, &mut sniffer, &tail)?;
        self.forward(request_id, lines.push(&tail), guard);
        if let Some(last) = lines.finish() {
            self.forward(request_id, vec![last], guard);
        }
        Ok(())
    }

    /// Fails the stream once the text seen so far contains a challenge page.
    fn check_markup(
        &self,
        request_id: &str,
        sniffer: &mut MarkupSniffer,
        text: &str,
    ) -> Result<(), ExecutionError> {
        match sniffer.observe(text) {
            Some(markup) if self.detector.is_challenge_text(markup) => {
                log::warn!("challenge markup in the stream of {request_id}");
                Err(ExecutionError::ChallengeDetected)
            }
            _ => Ok(()),
        }
    }

    fn forward(&self, request_id: &str, lines: Vec<String>, guard: &ExecutionGuard) {
        for line in lines {
            if guard.is_cancelled() {
                return;
            }
            self.frames.line(request_id, line);
        }
    }
}
