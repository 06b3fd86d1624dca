//! Shared domain types: sessions, task kinds, plans, tool records, events.
//!
//! Enum values that reach SQLite or the wire carry `as_str`/`parse` pairs so
//! the stored text form stays decoupled from the Rust identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors produced when parsing stored or wire-format enum text.
#[derive(Debug, thiserror::Error)]
#[error("invalid {field} value: {value}")]
pub struct InvalidEnum {
    /// Field name being parsed.
    pub field: &'static str,
    /// Rejected value.
    pub value: String,
}

/// Kind of task a worker agent can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Fingerprint a web-exposed AI component and match advisories.
    AiinfraScan,
    /// Static security audit of an MCP server.
    McpScan,
    /// Jailbreak / prompt-security evaluation of a model endpoint.
    Jailbreak,
    /// Behavioral scan of a deployed agent.
    AgentScan,
    /// Aggregate red-team report generation.
    RedteamReport,
}

impl TaskKind {
    /// Wire and storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiinfraScan => "aiinfra_scan",
            Self::McpScan => "mcp_scan",
            Self::Jailbreak => "jailbreak",
            Self::AgentScan => "agent_scan",
            Self::RedteamReport => "redteam_report",
        }
    }

    /// Parse from wire or SQLite text.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised task kind.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "aiinfra_scan" => Ok(Self::AiinfraScan),
            "mcp_scan" => Ok(Self::McpScan),
            "jailbreak" => Ok(Self::Jailbreak),
            "agent_scan" => Ok(Self::AgentScan),
            "redteam_report" => Ok(Self::RedteamReport),
            other => Err(InvalidEnum {
                field: "task_kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// Session lifecycle status.
///
/// `Accepted` and `Dispatched` are transient scheduling states; `Done`,
/// `Failed`, and `Terminated` are terminal and immutable once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Validated and persisted, not yet handed to an agent.
    Accepted,
    /// No capable agent was available; waiting for capacity.
    Queued,
    /// Sent to an agent, no progress frame received yet.
    Dispatched,
    /// Agent has reported progress.
    Running,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
    /// Cancelled by the owner.
    Terminated,
}

impl SessionStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    /// Parse from SQLite text.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "queued" => Ok(Self::Queued),
            "dispatched" => Ok(Self::Dispatched),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(InvalidEnum {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }

    /// Whether this status is terminal. Terminal sessions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Terminated)
    }
}

/// Response language requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Chinese.
    Zh,
    /// English.
    #[default]
    En,
}

impl Language {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zh => "zh",
            Self::En => "en",
        }
    }
}

/// Status of a plan step. Only advances `Todo` → `Doing` → `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not started.
    Todo,
    /// In progress.
    Doing,
    /// Finished.
    Done,
}

impl StepStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Doing => "doing",
            Self::Done => "done",
        }
    }

    /// Parse from SQLite text.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised step status.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "todo" => Ok(Self::Todo),
            "doing" => Ok(Self::Doing),
            "done" => Ok(Self::Done),
            other => Err(InvalidEnum {
                field: "step_status",
                value: other.to_owned(),
            }),
        }
    }

    /// Ordering rank used to reject backwards transitions.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Todo => 0,
            Self::Doing => 1,
            Self::Done => 2,
        }
    }
}

/// Status of a tool-use record. Only advances `Doing` → `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// Tool is running.
    Doing,
    /// Tool finished.
    Done,
}

impl ToolStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Doing => "doing",
            Self::Done => "done",
        }
    }

    /// Parse from SQLite text.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised tool status.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "doing" => Ok(Self::Doing),
            "done" => Ok(Self::Done),
            other => Err(InvalidEnum {
                field: "tool_status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Per-step progress reported by an agent alongside step updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStepStatus {
    /// Step work in progress.
    Running,
    /// Step work finished.
    Completed,
}

/// One entry in a task's execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Stable step identifier within the session.
    pub step_id: String,
    /// Human-readable step title. Set once by the handler.
    pub title: String,
    /// Current step status.
    pub status: StepStatus,
    /// When the step left `Todo`, if it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// A tool invocation reported within a plan step. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    /// Stable tool invocation id.
    pub tool_id: String,
    /// Tool name (e.g. "http_probe").
    pub name: String,
    /// Lifecycle status.
    pub status: ToolStatus,
    /// One-line summary of what the tool is doing.
    #[serde(default)]
    pub brief: String,
    /// Action verb (e.g. "GET").
    #[serde(default)]
    pub action: String,
    /// Target of the action (e.g. a URL).
    #[serde(default)]
    pub target: String,
    /// Short result summary, filled when the tool completes.
    #[serde(default)]
    pub result_summary: String,
}

/// Event types streamed to SSE subscribers.
///
/// Wire names are camelCase to match the client event schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    /// Full plan snapshot.
    PlanUpdate,
    /// A new step was opened.
    NewPlanStep,
    /// A step's status changed.
    StepStatusUpdate,
    /// Tool lifecycle update.
    ToolUsed,
    /// Streaming tool log line.
    ToolUseLog,
    /// Final structured result.
    ResultUpdate,
    /// Fatal task error.
    Error,
    /// Stream end marker.
    End,
}

impl EventType {
    /// Wire and storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanUpdate => "planUpdate",
            Self::NewPlanStep => "newPlanStep",
            Self::StepStatusUpdate => "stepStatusUpdate",
            Self::ToolUsed => "toolUsed",
            Self::ToolUseLog => "toolUseLog",
            Self::ResultUpdate => "resultUpdate",
            Self::Error => "error",
            Self::End => "end",
        }
    }

    /// Parse from SQLite text.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised event type.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "planUpdate" => Ok(Self::PlanUpdate),
            "newPlanStep" => Ok(Self::NewPlanStep),
            "stepStatusUpdate" => Ok(Self::StepStatusUpdate),
            "toolUsed" => Ok(Self::ToolUsed),
            "toolUseLog" => Ok(Self::ToolUseLog),
            "resultUpdate" => Ok(Self::ResultUpdate),
            "error" => Ok(Self::Error),
            "end" => Ok(Self::End),
            other => Err(InvalidEnum {
                field: "event_type",
                value: other.to_owned(),
            }),
        }
    }
}

/// A persisted session event, totally ordered by `seq` within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Per-session monotonic sequence number, starting at 0.
    pub seq: i64,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Event payload.
    pub content: serde_json::Value,
}

/// Identity a worker announces when it connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Stable agent id (usually hostname + random suffix).
    pub agent_id: String,
    /// Worker hostname.
    pub hostname: String,
    /// Worker IP as seen locally.
    pub ip: String,
    /// Worker build version.
    pub version: String,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Task kinds this worker can execute.
    pub capabilities: Vec<TaskKind>,
}

/// Validate a client-supplied session id: `^[A-Za-z0-9_-]{1,50}$`.
pub fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 50
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate an uploaded file name: non-empty, no path separators, no `..`.
pub fn valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_accepts_word_chars() {
        assert!(valid_session_id("abc_123"));
        assert!(valid_session_id("A-b-9"));
    }

    #[test]
    fn session_id_rejects_path_chars_and_bounds() {
        assert!(!valid_session_id(""));
        assert!(!valid_session_id("abc/..xyz"));
        assert!(!valid_session_id(&"x".repeat(51)));
    }

    #[test]
    fn file_name_rejects_traversal() {
        assert!(valid_file_name("report.pdf"));
        assert!(!valid_file_name("../etc/passwd"));
        assert!(!valid_file_name("a\\b"));
        assert!(!valid_file_name(""));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            SessionStatus::Accepted,
            SessionStatus::Queued,
            SessionStatus::Dispatched,
            SessionStatus::Running,
            SessionStatus::Done,
            SessionStatus::Failed,
            SessionStatus::Terminated,
        ] {
            assert_eq!(
                SessionStatus::parse(status.as_str()).expect("should parse"),
                status
            );
        }
        assert!(SessionStatus::Done.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
    }
}
