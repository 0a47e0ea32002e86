//! Reset flows triggered by distress signals.
//!
//! An identity reset (after HTTP 429) discards every cookie the session can
//! see and the stored credential before ending the session, so the upstream
//! sees a new anonymous visitor. A challenge reset only ends the session and
//! lets the next one wait the challenge out.

use std::sync::Arc;

use chrono::Utc;
use url::Url;

use crate::modules::cookies::SessionCookieJar;
use crate::modules::events::{EventDispatcher, RelayEvent, ResetEvent};
use crate::modules::state::CredentialStore;

use super::{ReloadTrigger, ResetGuard, ResetKind};

/// Session-scoped executor of the two reset flows.
pub struct ResetHandler {
    guard: ResetGuard,
    cookies: Arc<SessionCookieJar>,
    credentials: CredentialStore,
    origin: Url,
    trigger: Arc<dyn ReloadTrigger>,
    events: Arc<EventDispatcher>,
}

impl ResetHandler {
    pub fn new(
        cookies: Arc<SessionCookieJar>,
        credentials: CredentialStore,
        origin: Url,
        trigger: Arc<dyn ReloadTrigger>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            guard: ResetGuard::new(),
            cookies,
            credentials,
            origin,
            trigger,
            events,
        }
    }

    /// Runs the reset for `kind`. Returns `false` when another reset of this
    /// session already claimed the guard.
    pub fn reset(&self, kind: ResetKind) -> bool {
        match kind {
            ResetKind::Identity => self.identity_reset(),
            ResetKind::Challenge => self.challenge_reset(),
        }
    }

    pub fn identity_reset(&self) -> bool {
        if !self.guard.try_acquire() {
            log::debug!("identity reset skipped; a reset is already in progress");
            return false;
        }

        let cleared = self.cookies.clear_visible(&self.origin);
        if let Err(err) = self.credentials.clear() {
            log::error!("failed to delete stored credential: {err}");
        }
        self.finish(ResetKind::Identity, cleared);
        true
    }

    pub fn challenge_reset(&self) -> bool {
        if !self.guard.try_acquire() {
            log::debug!("challenge reset skipped; a reset is already in progress");
            return false;
        }
        self.finish(ResetKind::Challenge, 0);
        true
    }

    pub fn in_progress(&self) -> bool {
        self.guard.is_busy()
    }

    fn finish(&self, kind: ResetKind, cookies_cleared: usize) {
        self.events.dispatch(RelayEvent::Reset(ResetEvent {
            kind,
            cookies_cleared,
            timestamp: Utc::now(),
        }));
        self.trigger.reload(kind);
    }
}
