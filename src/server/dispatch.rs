//! Task dispatch, queueing, cancellation, and agent-frame translation.
//!
//! One dispatcher instance owns the fairness and lifecycle policy:
//! - `dispatch` selects an agent (least loaded, capability match) or
//!   queues the task until capacity appears.
//! - `on_capacity` re-runs selection for queued tasks whenever an agent
//!   connects or a task completes.
//! - `terminate` propagates a cancel frame and arms the deadline that
//!   converts a silent agent into a terminal `cancel_timeout` event.
//! - `handle_agent_frame` translates inbound agent frames into persisted,
//!   sequenced session events with their side effects.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use super::bus::EventBus;
use super::registry::AgentRegistry;
use super::store::events::FrameSideEffect;
use super::store::Store;
use crate::protocol::{AgentFrame, ServerFrame, TaskRequest};
use crate::types::{AgentStepStatus, EventType, SessionStatus, StepStatus};

/// Outcome of a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Task was sent to an agent.
    Dispatched,
    /// No capable agent; task is queued.
    Queued,
}

struct DispatcherInner {
    queue: VecDeque<TaskRequest>,
    /// Sessions with an outstanding cancel frame.
    pending_cancels: HashMap<String, ()>,
}

/// The task dispatcher.
pub struct Dispatcher {
    store: Store,
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    inner: Mutex<DispatcherInner>,
    cancel_deadline: Duration,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        registry: Arc<AgentRegistry>,
        cancel_deadline: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            inner: Mutex::new(DispatcherInner {
                queue: VecDeque::new(),
                pending_cancels: HashMap::new(),
            }),
            cancel_deadline,
        }
    }

    /// Dispatch a task to a capable agent, or queue it.
    pub async fn dispatch(&self, request: TaskRequest) -> DispatchOutcome {
        let session_id = request.session_id.clone();
        let kind = request.task_kind;

        if let Some((agent_id, tx)) = self.registry.pick(kind) {
            // try_send: dispatch may run inside an agent's own read loop, so
            // it must never block on that agent's outbound queue.
            if tx.try_send(ServerFrame::Task(request.clone())).is_ok() {
                self.registry.assign(&agent_id, &session_id);
                let _ = self
                    .store
                    .set_session_status(&session_id, SessionStatus::Dispatched)
                    .await;
                info!(session_id, agent_id, kind = kind.as_str(), "task dispatched");
                return DispatchOutcome::Dispatched;
            }
            // The chosen agent's channel is gone; its socket teardown will
            // unregister it. Fall through to the queue.
            warn!(session_id, agent_id, "selected agent channel closed");
        }

        self.lock().queue.push_back(request);
        let _ = self
            .store
            .set_session_status(&session_id, SessionStatus::Queued)
            .await;
        info!(session_id, kind = kind.as_str(), "no capable agent, task queued");
        DispatchOutcome::Queued
    }

    /// Re-run selection for queued tasks. Called on `agent_connected` and
    /// `task_completed` signals. Only tasks whose kind the available
    /// capacity can serve are dispatched; the rest stay queued in order.
    pub async fn on_capacity(&self) {
        loop {
            // Pop the first queued task an agent can serve right now.
            let next = {
                let mut inner = self.lock();
                let position = inner
                    .queue
                    .iter()
                    .position(|request| self.registry.pick_would_succeed(request.task_kind));
                position.and_then(|i| inner.queue.remove(i))
            };
            let Some(request) = next else {
                break;
            };
            let session_id = request.session_id.clone();
            if self.dispatch(request).await == DispatchOutcome::Queued {
                // Capacity vanished between the check and the send; stop
                // draining, the task is back in the queue.
                debug!(session_id, "requeue race, stopping drain");
                break;
            }
        }
    }

    /// Cancel a session. Queued tasks terminate immediately; dispatched
    /// tasks get a cancel frame and a deadline.
    pub async fn terminate(&self, session_id: &str) {
        // Queued and never dispatched: terminal right away.
        let was_queued = {
            let mut inner = self.lock();
            let before = inner.queue.len();
            inner.queue.retain(|request| request.session_id != session_id);
            inner.queue.len() != before
        };
        if was_queued {
            let _ = self
                .bus
                .publish(
                    session_id,
                    EventType::End,
                    json!({}),
                    FrameSideEffect::Terminate,
                )
                .await;
            info!(session_id, "queued task terminated");
            return;
        }

        self.lock()
            .pending_cancels
            .insert(session_id.to_owned(), ());

        match self.registry.agent_for_session(session_id) {
            Some((agent_id, tx)) => {
                let frame = ServerFrame::Cancel {
                    session_id: session_id.to_owned(),
                };
                if tx.try_send(frame).is_err() {
                    warn!(session_id, agent_id, "cancel frame undeliverable");
                }
                info!(session_id, agent_id, "cancel propagated");
            }
            None => {
                // Dispatch raced termination: no agent owns the session yet
                // (or it already finished). Resolve as terminated.
                let _ = self
                    .bus
                    .publish(
                        session_id,
                        EventType::End,
                        json!({}),
                        FrameSideEffect::Terminate,
                    )
                    .await;
                self.lock().pending_cancels.remove(session_id);
                return;
            }
        }

        self.arm_cancel_deadline(session_id.to_owned());
    }

    fn arm_cancel_deadline(&self, session_id: String) {
        let bus = Arc::clone(&self.bus);
        let store = self.store.clone();
        let registry = Arc::clone(&self.registry);
        let deadline = self.cancel_deadline;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let still_live = match store.get_session(&session_id).await {
                Ok(Some(session)) => !session.status.is_terminal(),
                _ => false,
            };
            if !still_live {
                return;
            }
            warn!(session_id, "cancel deadline exceeded");
            let _ = bus
                .publish(
                    &session_id,
                    EventType::Error,
                    json!({"kind": "cancel_timeout", "text": "agent did not confirm cancellation in time"}),
                    FrameSideEffect::None,
                )
                .await;
            let _ = bus
                .publish(
                    &session_id,
                    EventType::End,
                    json!({}),
                    FrameSideEffect::Terminate,
                )
                .await;
            registry.release(&session_id);
        });
    }

    /// Whether a cancel is outstanding for the session.
    pub fn cancel_pending(&self, session_id: &str) -> bool {
        self.lock().pending_cancels.contains_key(session_id)
    }

    /// Fail every session orphaned by a lost agent connection.
    pub async fn agent_lost(&self, agent_id: &str, orphaned: Vec<String>) {
        for session_id in orphaned {
            warn!(agent_id, session_id, "task failed: agent lost");
            let publish = self
                .bus
                .publish(
                    &session_id,
                    EventType::Error,
                    json!({"kind": "agent_lost", "text": "worker disconnected mid-task"}),
                    FrameSideEffect::Fail {
                        error: "agent_lost".to_owned(),
                    },
                )
                .await;
            if publish.is_err() {
                let _ = self.store.fail_session(&session_id, "agent_lost").await;
            }
            let _ = self
                .bus
                .publish(&session_id, EventType::End, json!({}), FrameSideEffect::None)
                .await;
            self.lock().pending_cancels.remove(&session_id);
        }
    }

    /// Translate one inbound agent frame into a persisted session event.
    pub async fn handle_agent_frame(&self, agent_id: &str, frame: AgentFrame) {
        let Some(session_id) = frame.session_id().map(str::to_owned) else {
            warn!(agent_id, "unexpected register frame mid-stream");
            return;
        };

        let (event_type, content, side) = match frame {
            AgentFrame::Register(_) => return,
            AgentFrame::PlanUpdate { tasks, .. } => (
                EventType::PlanUpdate,
                json!({ "tasks": &tasks }),
                FrameSideEffect::Plan { steps: tasks },
            ),
            AgentFrame::NewPlanStep { step_id, title, .. } => (
                EventType::NewPlanStep,
                json!({ "step_id": &step_id, "title": &title }),
                FrameSideEffect::NewStep { step_id, title },
            ),
            AgentFrame::StepStatusUpdate {
                step_id,
                status_id,
                agent_status,
                brief,
                description,
                ..
            } => (
                EventType::StepStatusUpdate,
                json!({
                    "step_id": &step_id,
                    "status_id": status_id,
                    "agent_status": agent_status,
                    "brief": brief,
                    "description": description,
                }),
                FrameSideEffect::StepStatus {
                    step_id,
                    status: match agent_status {
                        AgentStepStatus::Running => StepStatus::Doing,
                        AgentStepStatus::Completed => StepStatus::Done,
                    },
                },
            ),
            AgentFrame::ToolUsed {
                step_id,
                status_id,
                description,
                tools,
                ..
            } => (
                EventType::ToolUsed,
                json!({
                    "step_id": &step_id,
                    "status_id": status_id,
                    "description": description,
                    "tools": &tools,
                }),
                FrameSideEffect::Tools {
                    step_id,
                    records: tools,
                },
            ),
            AgentFrame::ActionLog {
                action_id,
                tool,
                plan_step_id,
                text,
                ..
            } => (
                EventType::ToolUseLog,
                json!({
                    "action_id": &action_id,
                    "tool": &tool,
                    "plan_step_id": &plan_step_id,
                    "text": &text,
                }),
                FrameSideEffect::ToolLog {
                    step_id: plan_step_id,
                    tool_id: tool,
                    action_id,
                    text,
                },
            ),
            AgentFrame::ResultUpdate { result, .. } => (
                EventType::ResultUpdate,
                json!({ "result": &result }),
                FrameSideEffect::Result { result },
            ),
            AgentFrame::Error { kind, text, .. } => (
                EventType::Error,
                json!({
                    "kind": kind.as_deref().unwrap_or("task_error"),
                    "text": &text,
                }),
                FrameSideEffect::Fail { error: text },
            ),
            AgentFrame::End { .. } => {
                let side = if self.cancel_pending(&session_id) {
                    FrameSideEffect::Terminate
                } else {
                    FrameSideEffect::Complete
                };
                (EventType::End, json!({}), side)
            }
        };

        let is_end = event_type == EventType::End;

        if let Err(err) = self.bus.publish(&session_id, event_type, content, side).await {
            // Persistence exhausted its retries: surface a structured error
            // and abort the task (best effort on both).
            warn!(session_id, error = %err, "failed to persist frame, aborting task");
            let _ = self.store.fail_session(&session_id, "io_error").await;
            let _ = self
                .bus
                .publish(
                    &session_id,
                    EventType::Error,
                    json!({"kind": "io_error", "text": "failed to persist task progress"}),
                    FrameSideEffect::None,
                )
                .await;
            if let Some((_, tx)) = self.registry.agent_for_session(&session_id) {
                let _ = tx.try_send(ServerFrame::Cancel {
                    session_id: session_id.clone(),
                });
            }
        }

        if is_end {
            self.registry.release(&session_id);
            self.lock().pending_cancels.remove(&session_id);
            self.bus.forget(&session_id).await;
            self.on_capacity().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DispatcherInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
