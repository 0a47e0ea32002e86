//! Recovery after a reload: wait out the challenge, wait for authentication
//! material, then replay the pending queue once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::challenges::core::poll_until;
use crate::challenges::solvers::TokenSource;
use crate::modules::events::RelayEvent;
use crate::modules::state::{PendingEntry, StoreError};

use super::RelayServices;
use super::auth::AuthenticationController;
use super::context::SessionContext;
use super::executor::{ExecutionOutcome, RequestExecutor};

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub challenge_timeout: Duration,
    pub challenge_interval: Duration,
    pub grace: Duration,
    pub auth_timeout: Duration,
    pub auth_interval: Duration,
    pub replay_delay: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            challenge_timeout: Duration::from_secs(45),
            challenge_interval: Duration::from_secs(1),
            grace: Duration::from_secs(2),
            auth_timeout: Duration::from_secs(60),
            auth_interval: Duration::from_secs(1),
            replay_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    NothingPending,
    /// The page stayed a challenge; the queue was left for the next session.
    ChallengeTimeout { pending: usize },
    Replayed {
        outcomes: Vec<(String, ExecutionOutcome)>,
        /// Entries put back because the session ended mid-replay.
        requeued: usize,
    },
}

pub struct RecoveryOrchestrator {
    services: Arc<RelayServices>,
    auth: Arc<AuthenticationController>,
    tokens: TokenSource,
    executor: Arc<RequestExecutor>,
    ctx: Arc<SessionContext>,
    settings: RecoverySettings,
}

impl RecoveryOrchestrator {
    pub fn new(
        services: Arc<RelayServices>,
        auth: Arc<AuthenticationController>,
        tokens: TokenSource,
        executor: Arc<RequestExecutor>,
        ctx: Arc<SessionContext>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            services,
            auth,
            tokens,
            executor,
            ctx,
            settings,
        }
    }

    pub async fn run(&self) -> Result<RecoveryOutcome, StoreError> {
        let pending = self.services.queue.len()?;
        if pending == 0 {
            return Ok(RecoveryOutcome::NothingPending);
        }
        log::info!("recovering {pending} pending request(s)");
        self.services.events.dispatch(RelayEvent::recovery(pending, "waiting_for_challenge"));

        let cleared = poll_until(
            self.settings.challenge_interval,
            self.settings.challenge_timeout,
            || self.page_is_clear(),
        )
        .await;
        if !cleared.is_satisfied() {
            log::warn!("challenge did not clear; leaving {pending} request(s) queued");
            self.services.events.dispatch(RelayEvent::recovery(pending, "challenge_timeout"));
            return Ok(RecoveryOutcome::ChallengeTimeout { pending });
        }

        sleep(self.settings.grace).await;
        self.wait_for_auth_material(pending).await;

        let entries = self.services.queue.take_all()?;
        self.services.events.dispatch(RelayEvent::recovery(entries.len(), "replaying"));

        let mut outcomes = Vec::with_capacity(entries.len());
        let mut remaining = entries.into_iter().peekable();
        while let Some(entry) = remaining.next() {
            if self.ctx.is_stopping() {
                return self.requeue(std::iter::once(entry).chain(remaining), outcomes);
            }

            let request_id = entry.request_id.clone();
            let guard = self.ctx.register(&request_id);
            let outcome = self.executor.replay(entry, guard).await;
            log::debug!("replayed {request_id}: {outcome:?}");
            outcomes.push((request_id, outcome));

            if remaining.peek().is_some() {
                let stop = self.ctx.stop_token();
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = sleep(self.settings.replay_delay) => {}
                }
            }
        }

        self.services.events.dispatch(RelayEvent::recovery(0, "complete"));
        Ok(RecoveryOutcome::Replayed {
            outcomes,
            requeued: 0,
        })
    }

    async fn page_is_clear(&self) -> bool {
        match self.services.origin_page().await {
            Some(markup) => !self.services.detector.is_challenge_page(&markup),
            None => false,
        }
    }

    /// Bounded wait for a credential or a token. The widget is started at
    /// the halfway mark if neither has shown up by then.
    async fn wait_for_auth_material(&self, pending: usize) {
        let started = Instant::now();
        let halfway = self.settings.auth_timeout / 2;
        let widget_started = AtomicBool::new(false);

        let outcome = poll_until(self.settings.auth_interval, self.settings.auth_timeout, || {
            let widget_started = &widget_started;
            async move {
                if self.auth.is_ready() || self.tokens.latest_token().is_some() {
                    return true;
                }
                if started.elapsed() >= halfway && !widget_started.swap(true, Ordering::AcqRel) {
                    self.services.events.dispatch(RelayEvent::recovery(pending, "starting_widget"));
                    if let Err(err) = self.tokens.ensure_widget().await {
                        log::warn!("could not start verification widget: {err}");
                    }
                }
                false
            }
        })
        .await;

        if !outcome.is_satisfied() {
            log::warn!("no credential or token after {:?}; replaying anyway", self.settings.auth_timeout);
        }
    }

    fn requeue<I>(
        &self,
        entries: I,
        outcomes: Vec<(String, ExecutionOutcome)>,
    ) -> Result<RecoveryOutcome, StoreError>
    where
        I: Iterator<Item = PendingEntry>,
    {
        let mut requeued = 0;
        for entry in entries {
            if self.services.queue.push_if_absent(entry)? {
                requeued += 1;
            }
        }
        log::info!("session ended mid-replay; {requeued} request(s) re-queued");
        self.services.events.dispatch(RelayEvent::recovery(requeued, "interrupted"));
        Ok(RecoveryOutcome::Replayed { outcomes, requeued })
    }
}
