//! Task handler abstractions.

pub mod external;
pub mod infra_scan;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::emitter::{Emitter, EmitterError};
use armitage::protocol::TaskRequest;
use armitage::types::TaskKind;

/// Per-task execution context: a cooperative cancellation signal.
#[derive(Clone)]
pub struct TaskContext {
    cancel: watch::Receiver<bool>,
}

impl TaskContext {
    /// Wrap a cancellation receiver.
    pub fn new(cancel: watch::Receiver<bool>) -> Self {
        Self { cancel }
    }

    /// Whether cancellation has been requested. Handlers must check this
    /// at iteration boundaries and between tool calls.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        while !*cancel.borrow() {
            if cancel.changed().await.is_err() {
                // Sender dropped: the task owner is gone, treat as cancel.
                return;
            }
        }
    }

    /// The raw receiver, for APIs that poll it directly.
    pub fn receiver(&self) -> &watch::Receiver<bool> {
        &self.cancel
    }
}

/// Handler failures surfaced to the control plane.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The request was malformed for this handler.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// The task was cancelled; the runner ends the stream quietly.
    #[error("task cancelled")]
    Cancelled,
    /// The task failed.
    #[error("{0}")]
    Failed(String),
    /// Progress emission failed (connection gone or contract violated).
    #[error("emitter: {0}")]
    Emitter(#[from] EmitterError),
}

/// A task handler executes one task kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Kind this handler serves.
    fn kind(&self) -> TaskKind;

    /// Execute the task, streaming progress through the emitter.
    ///
    /// The handler must emit `plan_update` first, `result_update` at most
    /// once, and respect `ctx` within a bounded time (soft budget 5 s).
    /// The runner emits the final `end`.
    ///
    /// # Errors
    ///
    /// Returns an error to fail the task; [`HandlerError::Cancelled`]
    /// ends it without an error frame.
    async fn execute(
        &self,
        ctx: TaskContext,
        request: TaskRequest,
        emitter: Emitter,
    ) -> Result<(), HandlerError>;
}

/// Handler registry keyed by task kind.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its kind; the last registration wins.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Look up the handler for a kind.
    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).map(Arc::clone)
    }

    /// Kinds this worker advertises.
    pub fn capabilities(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }
}

/// Soft budget a handler gets to notice cancellation before the runner
/// aborts it.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);
