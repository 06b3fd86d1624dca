//! Per-task workers: concurrency limit, cancellation, end-of-stream.
//!
//! Each dispatched task runs on its own tokio task behind a semaphore
//! (default 4 concurrent). Every worker owns a cancel signal derived from
//! the connection lifetime; a `cancel` frame flips it, the handler gets a
//! grace window to unwind, and the runner force-aborts after that. The
//! runner -- not the handler -- always emits the final `end` frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{info, warn};

use crate::emitter::Emitter;
use crate::handlers::{HandlerError, HandlerRegistry, TaskContext, CANCEL_GRACE};
use armitage::protocol::{AgentFrame, TaskRequest};

/// Runs tasks for one control-plane connection.
pub struct TaskRunner {
    handlers: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
    outbound: mpsc::Sender<AgentFrame>,
    active: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl TaskRunner {
    /// Create a runner with a concurrency limit.
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        max_concurrent: usize,
        outbound: mpsc::Sender<AgentFrame>,
    ) -> Self {
        Self {
            handlers,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            outbound,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a worker for a dispatched task.
    pub fn start(&self, request: TaskRequest) {
        let session_id = request.session_id.clone();
        let Some(handler) = self.handlers.get(request.task_kind) else {
            warn!(session_id, kind = request.task_kind.as_str(), "no handler registered");
            let outbound = self.outbound.clone();
            tokio::spawn(async move {
                let emitter = Emitter::new(session_id, outbound);
                let _ = emitter
                    .error(&format!(
                        "worker has no handler for {}",
                        request.task_kind.as_str()
                    ))
                    .await;
                let _ = emitter.end().await;
            });
            return;
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        lock_active(&self.active).insert(session_id.clone(), cancel_tx);

        let semaphore = Arc::clone(&self.semaphore);
        let outbound = self.outbound.clone();
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            info!(session_id, kind = request.task_kind.as_str(), "task started");

            let emitter = Emitter::new(session_id.clone(), outbound);
            let ctx = TaskContext::new(cancel_rx.clone());
            let work = handler.execute(ctx, request, emitter.clone());
            tokio::pin!(work);

            let result = tokio::select! {
                result = &mut work => result,
                () = cancelled_then_grace(cancel_rx.clone()) => {
                    warn!(session_id, "handler exceeded cancel grace, aborting");
                    Err(HandlerError::Cancelled)
                }
            };

            match result {
                Ok(()) => info!(session_id, "task finished"),
                Err(HandlerError::Cancelled) => info!(session_id, "task cancelled"),
                Err(err) => {
                    warn!(session_id, error = %err, "task failed");
                    if !emitter.errored() {
                        let _ = emitter.error(&err.to_string()).await;
                    }
                }
            }
            let _ = emitter.end().await;

            lock_active(&active).remove(&session_id);
        });
    }

    /// Flip the cancel signal for a session.
    pub fn cancel(&self, session_id: &str) {
        let active = lock_active(&self.active);
        match active.get(session_id) {
            Some(cancel) => {
                info!(session_id, "cancel requested");
                let _ = cancel.send(true);
            }
            None => {
                warn!(session_id, "cancel for unknown task");
            }
        }
    }

    /// Cancel everything; used when the connection drops.
    pub fn cancel_all(&self) {
        let active = lock_active(&self.active);
        for (session_id, cancel) in active.iter() {
            info!(session_id = %session_id, "aborting task on disconnect");
            let _ = cancel.send(true);
        }
    }

    /// Number of tasks currently tracked.
    pub fn active_count(&self) -> usize {
        lock_active(&self.active).len()
    }
}

/// Resolves once cancellation is requested and the grace window has
/// elapsed.
async fn cancelled_then_grace(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            break;
        }
        if cancel.changed().await.is_err() {
            break;
        }
    }
    tokio::time::sleep(CANCEL_GRACE).await;
}

fn lock_active(
    active: &Mutex<HashMap<String, watch::Sender<bool>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
    match active.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
