//! Cooperative wait utilities.
//!
//! Bounded polling used by the recovery flow, plus the jittered durations the
//! verification widget interaction relies on.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep};

/// Result of a bounded polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Satisfied,
    TimedOut,
}

impl PollOutcome {
    pub fn is_satisfied(self) -> bool {
        matches!(self, PollOutcome::Satisfied)
    }
}

/// Evaluates `probe` every `interval` until it returns `true` or `timeout`
/// elapses. The probe runs at least once; a probe still running when the
/// deadline passes is allowed to finish.
pub async fn poll_until<F, Fut>(interval: Duration, timeout: Duration, mut probe: F) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if probe().await {
            return PollOutcome::Satisfied;
        }
        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut;
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// Uniformly random duration in `[min, max)`; `min` when the range is empty.
pub fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    Duration::from_secs_f64(rng.gen_range(min.as_secs_f64()..max.as_secs_f64()))
}
