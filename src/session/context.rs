//! Per-connection session context.
//!
//! Owns everything a reload throws away: the frame sender of the current
//! connection, the root cancellation token, and the map of active executions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::challenges::solvers::{ReloadTrigger, ResetKind};
use crate::transport::FrameSender;

#[derive(Debug)]
struct ActiveExecution {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct SessionContext {
    frames: FrameSender,
    stop: CancellationToken,
    active: Mutex<HashMap<String, ActiveExecution>>,
    generation: AtomicU64,
    reload: Mutex<Option<ResetKind>>,
}

impl SessionContext {
    pub fn new(frames: FrameSender) -> Arc<Self> {
        Arc::new(Self {
            frames,
            stop: CancellationToken::new(),
            active: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            reload: Mutex::new(None),
        })
    }

    pub fn frames(&self) -> &FrameSender {
        &self.frames
    }

    /// Fires when the session ends, by reload or shutdown.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Ends the session without a reset, e.g. on relay shutdown.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Registers the cancellation handle for `request_id`. A second
    /// registration under the same id cancels the earlier execution.
    pub fn register(self: &Arc<Self>, request_id: &str) -> ExecutionGuard {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.stop.child_token();
        let previous = self.active.lock().ok().and_then(|mut active| {
            active.insert(
                request_id.to_string(),
                ActiveExecution {
                    generation,
                    cancel: cancel.clone(),
                },
            )
        });
        if let Some(previous) = previous {
            log::warn!("request {request_id} re-submitted; cancelling the earlier execution");
            previous.cancel.cancel();
        }

        ExecutionGuard {
            context: Arc::clone(self),
            request_id: request_id.to_string(),
            generation,
            cancel,
        }
    }

    /// Cancels the execution registered for `request_id`.
    pub fn abort(&self, request_id: &str) -> bool {
        let removed = self
            .active
            .lock()
            .ok()
            .and_then(|mut active| active.remove(request_id));
        match removed {
            Some(execution) => {
                execution.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every active execution and empties the map.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<ActiveExecution> = match self.active.lock() {
            Ok(mut active) => active.drain().map(|(_, execution)| execution).collect(),
            Err(_) => Vec::new(),
        };
        for execution in &drained {
            execution.cancel.cancel();
        }
        drained.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }

    pub fn is_active(&self, request_id: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(request_id))
            .unwrap_or(false)
    }

    /// Kind of the reset that ended this session, if any.
    pub fn reload_requested(&self) -> Option<ResetKind> {
        self.reload.lock().ok().and_then(|reload| *reload)
    }

    fn release(&self, request_id: &str, generation: u64) {
        if let Ok(mut active) = self.active.lock()
            && active
                .get(request_id)
                .is_some_and(|execution| execution.generation == generation)
        {
            active.remove(request_id);
        }
    }
}

impl ReloadTrigger for SessionContext {
    fn reload(&self, kind: ResetKind) {
        if let Ok(mut reload) = self.reload.lock() {
            reload.get_or_insert(kind);
        }
        log::info!("session reload requested ({kind:?})");
        self.stop.cancel();
    }
}

/// Registration of one execution; dropping it removes the entry from the
/// active map unless a newer execution took over the id.
#[derive(Debug)]
pub struct ExecutionGuard {
    context: Arc<SessionContext>,
    request_id: String,
    generation: u64,
    cancel: CancellationToken,
}

impl ExecutionGuard {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.context.release(&self.request_id, self.generation);
    }
}
