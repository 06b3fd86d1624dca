//! Per-task progress emitter.
//!
//! The emitter is the only path from a handler to the wire, and it
//! enforces the handler contract:
//! - `plan_update` precedes any step or tool emission,
//! - `result_update` happens at most once and never after `error`,
//! - `end` is always the last frame (the runner emits it).
//!
//! Structural frames (plan, step, tool, result, error) go through a
//! bounded channel straight to the connection and backpressure the
//! handler. Log lines go through a drop-oldest queue drained by a
//! forwarder task, so a log burst can never stall or reorder structural
//! events.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};
use uuid::Uuid;

use armitage::protocol::AgentFrame;
use armitage::types::{AgentStepStatus, PlanStep, ToolRecord};

/// Log lines buffered before the oldest is dropped.
const LOG_QUEUE_CAPACITY: usize = 512;

/// Emitter contract violations and transport failures.
#[derive(Debug, thiserror::Error)]
pub enum EmitterError {
    /// A step/tool emission arrived before the plan.
    #[error("plan_update must precede other emissions")]
    PlanNotFirst,
    /// A second result emission.
    #[error("result_update may be emitted at most once")]
    ResultTwice,
    /// A result emission after a fatal error.
    #[error("result_update after error")]
    ResultAfterError,
    /// The connection is gone; the task should abort.
    #[error("connection closed")]
    Closed,
}

#[derive(Default)]
struct EmitState {
    plan_sent: bool,
    result_sent: bool,
    errored: bool,
}

struct LogQueue {
    lines: Mutex<VecDeque<AgentFrame>>,
    notify: Notify,
}

/// Per-task progress emitter. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Emitter {
    session_id: String,
    structural: mpsc::Sender<AgentFrame>,
    logs: Arc<LogQueue>,
    state: Arc<Mutex<EmitState>>,
}

impl Emitter {
    /// Create an emitter writing to the connection's outbound channel and
    /// spawn its log forwarder.
    pub fn new(session_id: String, outbound: mpsc::Sender<AgentFrame>) -> Self {
        let logs = Arc::new(LogQueue {
            lines: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });

        let forwarder_logs = Arc::clone(&logs);
        let forwarder_out = outbound.clone();
        tokio::spawn(async move {
            loop {
                let frame = {
                    let mut lines = lock_queue(&forwarder_logs.lines);
                    lines.pop_front()
                };
                match frame {
                    Some(frame) => {
                        if forwarder_out.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Queue drained; wake on the next push. The timeout
                        // re-checks liveness so the task exits once every
                        // emitter clone is gone.
                        if Arc::strong_count(&forwarder_logs) == 1 {
                            break;
                        }
                        let _ = tokio::time::timeout(
                            std::time::Duration::from_secs(1),
                            forwarder_logs.notify.notified(),
                        )
                        .await;
                    }
                }
            }
            trace!("log forwarder stopped");
        });

        Self {
            session_id,
            structural: outbound,
            logs,
            state: Arc::new(Mutex::new(EmitState::default())),
        }
    }

    /// Session this emitter belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Emit the full plan. Must be the first emission.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is closed.
    pub async fn plan_update(&self, tasks: Vec<PlanStep>) -> Result<(), EmitterError> {
        lock_state(&self.state).plan_sent = true;
        self.send(AgentFrame::PlanUpdate {
            session_id: self.session_id.clone(),
            tasks,
        })
        .await
    }

    /// Open a new plan step.
    ///
    /// # Errors
    ///
    /// Returns an error on contract violation or closed connection.
    pub async fn new_plan_step(&self, step_id: &str, title: &str) -> Result<(), EmitterError> {
        self.require_plan()?;
        self.send(AgentFrame::NewPlanStep {
            session_id: self.session_id.clone(),
            step_id: step_id.to_owned(),
            title: title.to_owned(),
        })
        .await
    }

    /// Emit a step progress update. Returns the generated status id.
    ///
    /// # Errors
    ///
    /// Returns an error on contract violation or closed connection.
    pub async fn step_status(
        &self,
        step_id: &str,
        agent_status: AgentStepStatus,
        brief: &str,
        description: &str,
    ) -> Result<String, EmitterError> {
        self.require_plan()?;
        let status_id = Uuid::new_v4().to_string();
        self.send(AgentFrame::StepStatusUpdate {
            session_id: self.session_id.clone(),
            step_id: step_id.to_owned(),
            status_id: status_id.clone(),
            agent_status,
            brief: brief.to_owned(),
            description: description.to_owned(),
        })
        .await?;
        Ok(status_id)
    }

    /// Emit tool lifecycle records for a step.
    ///
    /// # Errors
    ///
    /// Returns an error on contract violation or closed connection.
    pub async fn tool_used(
        &self,
        step_id: &str,
        description: &str,
        tools: Vec<ToolRecord>,
    ) -> Result<(), EmitterError> {
        self.require_plan()?;
        self.send(AgentFrame::ToolUsed {
            session_id: self.session_id.clone(),
            step_id: step_id.to_owned(),
            status_id: Uuid::new_v4().to_string(),
            description: description.to_owned(),
            tools,
        })
        .await
    }

    /// Queue a streaming log line. Never blocks; the oldest line is
    /// dropped when the queue is full.
    pub fn tool_log(&self, action_id: &str, tool: &str, step_id: &str, text: &str) {
        let frame = AgentFrame::ActionLog {
            session_id: self.session_id.clone(),
            action_id: action_id.to_owned(),
            tool: tool.to_owned(),
            plan_step_id: step_id.to_owned(),
            text: text.to_owned(),
        };
        let mut lines = lock_queue(&self.logs.lines);
        if lines.len() >= LOG_QUEUE_CAPACITY {
            lines.pop_front();
            debug!(session_id = %self.session_id, "log queue full, oldest line dropped");
        }
        lines.push_back(frame);
        drop(lines);
        self.logs.notify.notify_one();
    }

    /// Emit the final result. At most once, and never after an error.
    ///
    /// # Errors
    ///
    /// Returns an error on contract violation or closed connection.
    pub async fn result_update(&self, result: Value) -> Result<(), EmitterError> {
        {
            let mut state = lock_state(&self.state);
            if state.errored {
                return Err(EmitterError::ResultAfterError);
            }
            if state.result_sent {
                return Err(EmitterError::ResultTwice);
            }
            state.result_sent = true;
        }
        self.send(AgentFrame::ResultUpdate {
            session_id: self.session_id.clone(),
            result,
        })
        .await
    }

    /// Emit a fatal task error.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is closed.
    pub async fn error(&self, text: &str) -> Result<(), EmitterError> {
        self.emit_error(None, text).await
    }

    /// Emit a fatal task error with a machine-readable kind (e.g.
    /// `no_rules_loaded`). The kind reaches clients in the error event's
    /// content.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is closed.
    pub async fn error_kind(&self, kind: &str, text: &str) -> Result<(), EmitterError> {
        self.emit_error(Some(kind.to_owned()), text).await
    }

    async fn emit_error(&self, kind: Option<String>, text: &str) -> Result<(), EmitterError> {
        lock_state(&self.state).errored = true;
        self.send(AgentFrame::Error {
            session_id: self.session_id.clone(),
            kind,
            text: text.to_owned(),
        })
        .await
    }

    /// Emit the terminal end marker. Called by the runner, last.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is closed.
    pub async fn end(&self) -> Result<(), EmitterError> {
        self.send(AgentFrame::End {
            session_id: self.session_id.clone(),
        })
        .await
    }

    /// Whether a fatal error has been emitted.
    pub fn errored(&self) -> bool {
        lock_state(&self.state).errored
    }

    fn require_plan(&self) -> Result<(), EmitterError> {
        if lock_state(&self.state).plan_sent {
            Ok(())
        } else {
            Err(EmitterError::PlanNotFirst)
        }
    }

    async fn send(&self, frame: AgentFrame) -> Result<(), EmitterError> {
        self.structural
            .send(frame)
            .await
            .map_err(|_| EmitterError::Closed)
    }
}

fn lock_state(state: &Mutex<EmitState>) -> std::sync::MutexGuard<'_, EmitState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_queue(queue: &Mutex<VecDeque<AgentFrame>>) -> std::sync::MutexGuard<'_, VecDeque<AgentFrame>> {
    match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
