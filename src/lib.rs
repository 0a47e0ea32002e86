//! # arena-relay-rs
//!
//! Relays chat-completion requests from a controller to an upstream web
//! application's internal API while presenting a consistent browser session,
//! and streams the upstream output back over a websocket.
//!
//! The relay survives the upstream's anti-automation defences without losing
//! work: requests hit by a rate limit or a challenge page are parked in a
//! durable queue, the session is reset, and the queue is replayed once the
//! next session is authenticated again.
//!
//! ## Features
//!
//! - JSON-framed controller channel with heartbeat and reconnect
//! - Challenge page detection on documents and raw response text
//! - Verification token source backed by a pluggable widget (CapSolver adapter
//!   included)
//! - Two-step credential exchange with durable credential reuse
//! - Streaming executor with mid-stream challenge detection
//! - Attachment upload pipeline
//! - redb-backed pending queue surviving restarts
//!
//! ## Example
//!
//! ```no_run
//! use arena_relay_rs::{Relay, RelayConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = Relay::new(RelayConfig::default())?;
//!     relay.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

mod relay;

pub mod challenges;
pub mod config;
pub mod external_deps;
pub mod modules;
pub mod session;
pub mod transport;

pub use crate::relay::{Relay, RelayBuilder, RelayError, RelayResult, SessionEnd};

pub use crate::config::{ConfigError, EndpointTemplates, RelayConfig};

pub use crate::challenges::core::{
    ReqwestUpstreamClient,
    StreamingResponse,
    UpstreamClientError,
    UpstreamHttpClient,
    UpstreamRequest,
    UpstreamResponse,
};

pub use crate::challenges::detectors::{ChallengeDetector, DetectionSignals, PageVerdict};

pub use crate::challenges::solvers::{ResetKind, TokenSource, TokenWait};

pub use crate::external_deps::captcha::{
    CapSolverProvider,
    CaptchaConfig,
    CaptchaError,
    CaptchaProvider,
    CaptchaResult,
    CaptchaSolution,
    CaptchaTask,
    CaptchaWidget,
    DisabledWidget,
    TurnstileWidget,
    WidgetConfig,
    WidgetContainer,
    WidgetError,
    WidgetHandle,
};

pub use crate::modules::{
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    PendingEntry,
    PendingQueue,
    RelayEvent,
    SessionCookieJar,
    StateStore,
    StoreError,
};

pub use crate::session::{
    ApiVersion,
    ApiVersionSetting,
    ExecutionError,
    ExecutionOutcome,
    PageRegistryExtractor,
    RegistrySource,
};

pub use crate::transport::{CloseReason, InboundMessage, OutboundMessage, WorkItem};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
