//! Read-side queries for plans, tool records, logs, and results.

use serde::Serialize;
use sqlx::Row;

use super::{Store, StoreError};
use crate::types::{PlanStep, StepStatus, ToolRecord, ToolStatus};

/// A tool record joined with its owning step, as returned by detail views.
#[derive(Debug, Clone, Serialize)]
pub struct StoredTool {
    /// Step the tool ran under.
    pub step_id: String,
    /// The tool record.
    #[serde(flatten)]
    pub record: ToolRecord,
}

/// One persisted tool log line.
#[derive(Debug, Clone, Serialize)]
pub struct StoredToolLog {
    /// Step the action ran under.
    pub step_id: String,
    /// Tool id.
    pub tool_id: String,
    /// Action grouping id.
    pub action_id: String,
    /// Log text.
    pub text: String,
}

impl Store {
    /// Ordered plan steps for a session.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn plan_steps(&self, session_id: &str) -> Result<Vec<PlanStep>, StoreError> {
        let rows = sqlx::query(
            "SELECT step_id, title, status, started_at FROM plan_steps \
             WHERE session_id = ?1 ORDER BY position",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let started_at: Option<String> = row.try_get("started_at")?;
            steps.push(PlanStep {
                step_id: row.try_get("step_id")?,
                title: row.try_get("title")?,
                status: StepStatus::parse(&status)?,
                started_at: started_at.and_then(|t| {
                    chrono::DateTime::parse_from_rfc3339(&t)
                        .ok()
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                }),
            });
        }
        Ok(steps)
    }

    /// Tool records for a session, insertion-ordered.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn tool_records(&self, session_id: &str) -> Result<Vec<StoredTool>, StoreError> {
        let rows = sqlx::query(
            "SELECT step_id, tool_id, name, status, brief, action, target, result_summary \
             FROM tool_records WHERE session_id = ?1 ORDER BY rowid",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        let mut tools = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            tools.push(StoredTool {
                step_id: row.try_get("step_id")?,
                record: ToolRecord {
                    tool_id: row.try_get("tool_id")?,
                    name: row.try_get("name")?,
                    status: ToolStatus::parse(&status)?,
                    brief: row.try_get("brief")?,
                    action: row.try_get("action")?,
                    target: row.try_get("target")?,
                    result_summary: row.try_get("result_summary")?,
                },
            });
        }
        Ok(tools)
    }

    /// Tool log lines for a session, insertion-ordered.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn tool_logs(&self, session_id: &str) -> Result<Vec<StoredToolLog>, StoreError> {
        let rows = sqlx::query(
            "SELECT step_id, tool_id, action_id, text FROM tool_logs \
             WHERE session_id = ?1 ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        let mut logs = Vec::with_capacity(rows.len());
        for row in rows {
            logs.push(StoredToolLog {
                step_id: row.try_get("step_id")?,
                tool_id: row.try_get("tool_id")?,
                action_id: row.try_get("action_id")?,
                text: row.try_get("text")?,
            });
        }
        Ok(logs)
    }

    /// Final result payload for a session, when one was recorded.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt JSON.
    pub async fn result(&self, session_id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query("SELECT result FROM results WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(self.pool())
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("result")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }
}
