//! Distress handling: the verification token source and the reset flows.
//!
//! Both reset flows end the current session through a [`ReloadTrigger`];
//! they share one single-flight [`ResetGuard`] per session.

pub mod rate_limit;
pub mod turnstile;

use std::sync::atomic::{AtomicBool, Ordering};

pub use rate_limit::ResetHandler;
pub use turnstile::{TokenSource, TokenSourceSettings, TokenWait, discover_site_key};

/// Which reset a distress signal escalates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetKind {
    /// HTTP 429: discard cookies and credential, then reload.
    Identity,
    /// Challenge page: reload only.
    Challenge,
}

/// Check-then-set flag preventing duplicate concurrent resets.
#[derive(Debug, Default)]
pub struct ResetGuard {
    busy: AtomicBool,
}

impl ResetGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the guard; `false` when a reset is already under way.
    pub fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Ends the current session so a fresh one is started.
pub trait ReloadTrigger: Send + Sync {
    fn reload(&self, kind: ResetKind);
}
