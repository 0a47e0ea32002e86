//! Event system for the relay.
//!
//! Provides hooks for logging and custom reactions around connection,
//! request, authentication and recovery activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::challenges::solvers::ResetKind;

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub url: String,
    pub connected: bool,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Start or end of one request execution.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub request_id: String,
    pub replay: bool,
    pub outcome: Option<String>,
    pub latency: Option<Duration>,
    pub timestamp: DateTime<Utc>,
}

/// A rate-limit or challenge signal observed for a request.
#[derive(Debug, Clone)]
pub struct DistressEvent {
    pub request_id: String,
    pub kind: ResetKind,
    pub queued: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResetEvent {
    pub kind: ResetKind,
    pub cookies_cleared: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub request_id: String,
    pub success: bool,
    pub status: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RecoveryEvent {
    pub pending: usize,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum RelayEvent {
    Connection(ConnectionEvent),
    RequestStarted(RequestEvent),
    RequestFinished(RequestEvent),
    Distress(DistressEvent),
    Reset(ResetEvent),
    Auth(AuthEvent),
    Recovery(RecoveryEvent),
}

impl RelayEvent {
    pub fn recovery(pending: usize, stage: impl Into<String>) -> Self {
        RelayEvent::Recovery(RecoveryEvent {
            pending,
            stage: stage.into(),
            timestamp: Utc::now(),
        })
    }
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &RelayEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher with the [`LoggingHandler`] already registered.
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: RelayEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &RelayEvent) {
        match event {
            RelayEvent::Connection(conn) if conn.connected => {
                log::info!("controller channel up: {}", conn.url);
            }
            RelayEvent::Connection(conn) => {
                log::warn!(
                    "controller channel down: {} ({})",
                    conn.url,
                    conn.detail.as_deref().unwrap_or("closed")
                );
            }
            RelayEvent::RequestStarted(req) => {
                log::info!(
                    "-> request {}{}",
                    req.request_id,
                    if req.replay { " (replay)" } else { "" }
                );
            }
            RelayEvent::RequestFinished(req) => {
                log::info!(
                    "<- request {} {} ({:.2}s)",
                    req.request_id,
                    req.outcome.as_deref().unwrap_or("done"),
                    req.latency.unwrap_or_default().as_secs_f64()
                );
            }
            RelayEvent::Distress(distress) => {
                log::warn!(
                    "{:?} signal for {} (queued={})",
                    distress.kind,
                    distress.request_id,
                    distress.queued
                );
            }
            RelayEvent::Reset(reset) => {
                log::warn!("{:?} reset, {} cookie(s) cleared", reset.kind, reset.cookies_cleared);
            }
            RelayEvent::Auth(auth) if auth.success => {
                log::info!("session established for {}", auth.request_id);
            }
            RelayEvent::Auth(auth) => {
                log::error!(
                    "auth exchange failed for {} (status {:?})",
                    auth.request_id,
                    auth.status
                );
            }
            RelayEvent::Recovery(recovery) => {
                log::info!("recovery [{} pending]: {}", recovery.pending, recovery.stage);
            }
        }
    }
}
