//! Dispatch protocol frames between the control plane and worker agents.
//!
//! Frames are JSON objects with a `type` discriminator, carried over a
//! bidirectional WebSocket. The control plane sends [`ServerFrame`]s; agents
//! send [`AgentFrame`]s. Neither side shares memory with the other -- session
//! state lives only in the control plane, and an agent is stateless between
//! reconnects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{AgentIdentity, AgentStepStatus, Language, PlanStep, TaskKind, ToolRecord};

/// A task dispatched to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Session this task belongs to.
    pub session_id: String,
    /// Handler to invoke.
    pub task_kind: TaskKind,
    /// Opaque handler parameters.
    #[serde(default)]
    pub params: Value,
    /// Primary user input (e.g. target URLs for a scan).
    #[serde(default)]
    pub content: String,
    /// File URLs previously uploaded through the control plane.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Requested response language.
    #[serde(default)]
    pub language: Language,
}

/// Frames sent by the control plane to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Acknowledges a `register` frame.
    RegisterAck {
        /// Echoed agent id.
        agent_id: String,
    },
    /// Dispatch a task to this agent.
    Task(TaskRequest),
    /// Cancel a running task. The agent must close the task context and
    /// emit a final `end` within the cancellation deadline.
    Cancel {
        /// Session to cancel.
        session_id: String,
    },
}

/// Frames sent by an agent to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// Announce identity and capabilities. Must be the first frame.
    Register(AgentIdentity),
    /// Full plan snapshot. Precedes any step update for the session.
    PlanUpdate {
        /// Owning session.
        session_id: String,
        /// Ordered plan entries.
        tasks: Vec<PlanStep>,
    },
    /// A new plan step was opened.
    NewPlanStep {
        /// Owning session.
        session_id: String,
        /// Step id.
        step_id: String,
        /// Step title.
        title: String,
    },
    /// Progress update for a plan step.
    StepStatusUpdate {
        /// Owning session.
        session_id: String,
        /// Step id.
        step_id: String,
        /// Update id, unique per emission.
        status_id: String,
        /// Running or completed.
        agent_status: AgentStepStatus,
        /// One-line progress summary.
        #[serde(default)]
        brief: String,
        /// Longer description.
        #[serde(default)]
        description: String,
    },
    /// Tool lifecycle update within a step.
    ToolUsed {
        /// Owning session.
        session_id: String,
        /// Step id the tools belong to.
        step_id: String,
        /// Update id, unique per emission.
        status_id: String,
        /// Update description.
        #[serde(default)]
        description: String,
        /// Tool records; `doing` precedes `done` for the same tool id.
        tools: Vec<ToolRecord>,
    },
    /// Streaming log line for a tool action.
    ActionLog {
        /// Owning session.
        session_id: String,
        /// Action id (groups lines of one action).
        action_id: String,
        /// Tool id the line belongs to.
        tool: String,
        /// Step id the action belongs to.
        plan_step_id: String,
        /// Log text.
        text: String,
    },
    /// Final structured result. Emitted at most once, on success only.
    ResultUpdate {
        /// Owning session.
        session_id: String,
        /// Result payload.
        result: Value,
    },
    /// Fatal task error.
    Error {
        /// Owning session.
        session_id: String,
        /// Machine-readable error kind (e.g. `no_rules_loaded`); absent
        /// for plain handler failures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        /// Human-readable error text.
        text: String,
    },
    /// Terminal stream marker. Always the last frame for a session.
    End {
        /// Owning session.
        session_id: String,
    },
}

impl AgentFrame {
    /// Session id this frame refers to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Register(_) => None,
            Self::PlanUpdate { session_id, .. }
            | Self::NewPlanStep { session_id, .. }
            | Self::StepStatusUpdate { session_id, .. }
            | Self::ToolUsed { session_id, .. }
            | Self::ActionLog { session_id, .. }
            | Self::ResultUpdate { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::End { session_id } => Some(session_id),
        }
    }
}
