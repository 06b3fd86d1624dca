//! Event rows and transactional frame application.
//!
//! Each inbound agent frame becomes exactly one event row plus its side
//! effects (session status, plan rows, tool rows) applied in a single
//! transaction. Events are keyed `(session_id, seq)`; `seq` is assigned by
//! the event bus and is the total order clients replay.

use serde_json::Value;
use sqlx::Row;

use super::{now_text, Store, StoreError};
use crate::types::{EventType, PlanStep, SessionEvent, StepStatus, ToolRecord};

/// Side effect applied atomically with an event row.
#[derive(Debug, Clone)]
pub enum FrameSideEffect {
    /// Event row only.
    None,
    /// Progress frame: promote `dispatched` → `running`.
    Progress,
    /// Full plan snapshot.
    Plan {
        /// Ordered plan entries.
        steps: Vec<PlanStep>,
    },
    /// A step was opened.
    NewStep {
        /// Step id.
        step_id: String,
        /// Step title.
        title: String,
    },
    /// A step changed status.
    StepStatus {
        /// Step id.
        step_id: String,
        /// New status.
        status: StepStatus,
    },
    /// Tool lifecycle updates within a step.
    Tools {
        /// Owning step.
        step_id: String,
        /// Records to upsert.
        records: Vec<ToolRecord>,
    },
    /// Streaming tool log line.
    ToolLog {
        /// Owning step.
        step_id: String,
        /// Tool the line belongs to.
        tool_id: String,
        /// Action grouping id.
        action_id: String,
        /// Log text.
        text: String,
    },
    /// Final result payload.
    Result {
        /// Result JSON.
        result: Value,
    },
    /// Fatal error: session becomes `failed`.
    Fail {
        /// Error text.
        error: String,
    },
    /// Stream end on success: session becomes `done`.
    Complete,
    /// Stream end after a cancel: session becomes `terminated`.
    Terminate,
}

impl Store {
    /// Append one event and apply its side effects in a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error on any database failure; nothing is partially
    /// applied.
    pub async fn apply_frame(
        &self,
        session_id: &str,
        seq: i64,
        event_type: EventType,
        content: &Value,
        side: &FrameSideEffect,
    ) -> Result<(), StoreError> {
        let now = now_text();
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO events (session_id, seq, event_type, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session_id)
        .bind(seq)
        .bind(event_type.as_str())
        .bind(content.to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET updated_at = ?1 WHERE session_id = ?2")
            .bind(&now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        let mark_progress = matches!(
            side,
            FrameSideEffect::Progress
                | FrameSideEffect::Plan { .. }
                | FrameSideEffect::NewStep { .. }
                | FrameSideEffect::StepStatus { .. }
                | FrameSideEffect::Tools { .. }
                | FrameSideEffect::ToolLog { .. }
        );
        if mark_progress {
            sqlx::query(
                "UPDATE sessions SET status = 'running' \
                 WHERE session_id = ?1 AND status = 'dispatched'",
            )
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        }

        match side {
            FrameSideEffect::None | FrameSideEffect::Progress => {}
            FrameSideEffect::Plan { steps } => {
                for (position, step) in steps.iter().enumerate() {
                    upsert_step(
                        &mut tx,
                        session_id,
                        step,
                        i64::try_from(position).unwrap_or(i64::MAX),
                        &now,
                    )
                    .await?;
                }
            }
            FrameSideEffect::NewStep { step_id, title } => {
                let step = PlanStep {
                    step_id: step_id.clone(),
                    title: title.clone(),
                    status: StepStatus::Doing,
                    started_at: None,
                };
                let position = next_step_position(&mut tx, session_id).await?;
                upsert_step(&mut tx, session_id, &step, position, &now).await?;
            }
            FrameSideEffect::StepStatus { step_id, status } => {
                advance_step_status(&mut tx, session_id, step_id, *status, &now).await?;
            }
            FrameSideEffect::Tools { step_id, records } => {
                for record in records {
                    upsert_tool(&mut tx, session_id, step_id, record).await?;
                }
            }
            FrameSideEffect::ToolLog {
                step_id,
                tool_id,
                action_id,
                text,
            } => {
                sqlx::query(
                    "INSERT INTO tool_logs (session_id, step_id, tool_id, action_id, text, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .bind(session_id)
                .bind(step_id)
                .bind(tool_id)
                .bind(action_id)
                .bind(text)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }
            FrameSideEffect::Result { result } => {
                sqlx::query(
                    "INSERT INTO results (session_id, result, created_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(session_id) DO UPDATE SET result = excluded.result",
                )
                .bind(session_id)
                .bind(result.to_string())
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }
            FrameSideEffect::Fail { error } => {
                sqlx::query(
                    "UPDATE sessions SET status = 'failed', error = ?1, updated_at = ?2 \
                     WHERE session_id = ?3 AND status NOT IN ('done', 'failed', 'terminated')",
                )
                .bind(error)
                .bind(&now)
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
            }
            FrameSideEffect::Complete => {
                sqlx::query(
                    "UPDATE sessions SET status = 'done', updated_at = ?1 \
                     WHERE session_id = ?2 AND status NOT IN ('done', 'failed', 'terminated')",
                )
                .bind(&now)
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
            }
            FrameSideEffect::Terminate => {
                sqlx::query(
                    "UPDATE sessions SET status = 'terminated', updated_at = ?1 \
                     WHERE session_id = ?2 AND status NOT IN ('done', 'failed', 'terminated')",
                )
                .bind(&now)
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Highest persisted sequence number for a session.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn last_seq(&self, session_id: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT MAX(seq) AS last FROM events WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(self.pool())
            .await?;
        Ok(row.try_get::<Option<i64>, _>("last")?)
    }

    /// All events with `seq >= from_seq`, in order.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn events_from(
        &self,
        session_id: &str,
        from_seq: i64,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, event_type, content FROM events \
             WHERE session_id = ?1 AND seq >= ?2 ORDER BY seq",
        )
        .bind(session_id)
        .bind(from_seq)
        .fetch_all(self.pool())
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_type: String = row.try_get("event_type")?;
            let content: String = row.try_get("content")?;
            events.push(SessionEvent {
                seq: row.try_get("seq")?,
                event_type: EventType::parse(&event_type)?,
                content: serde_json::from_str(&content)?,
            });
        }
        Ok(events)
    }
}

type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;

async fn next_step_position(tx: &mut Tx<'_>, session_id: &str) -> Result<i64, StoreError> {
    let row = sqlx::query("SELECT COALESCE(MAX(position), -1) AS p FROM plan_steps WHERE session_id = ?1")
        .bind(session_id)
        .fetch_one(&mut **tx)
        .await?;
    let position: i64 = row.try_get("p")?;
    Ok(position.saturating_add(1))
}

/// Upsert a plan step: titles are set once, status only moves forward.
async fn upsert_step(
    tx: &mut Tx<'_>,
    session_id: &str,
    step: &PlanStep,
    position: i64,
    now: &str,
) -> Result<(), StoreError> {
    let existing = sqlx::query("SELECT status FROM plan_steps WHERE session_id = ?1 AND step_id = ?2")
        .bind(session_id)
        .bind(&step.step_id)
        .fetch_optional(&mut **tx)
        .await?;

    match existing {
        None => {
            let started_at = step
                .started_at
                .map(|t| t.to_rfc3339())
                .or_else(|| (step.status != StepStatus::Todo).then(|| now.to_owned()));
            sqlx::query(
                "INSERT INTO plan_steps (session_id, step_id, position, title, status, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(session_id)
            .bind(&step.step_id)
            .bind(position)
            .bind(&step.title)
            .bind(step.status.as_str())
            .bind(started_at)
            .execute(&mut **tx)
            .await?;
        }
        Some(row) => {
            let current: String = row.try_get("status")?;
            let current = StepStatus::parse(&current)?;
            if step.status.rank() <= current.rank() {
                return Ok(());
            }
            sqlx::query(
                "UPDATE plan_steps SET status = ?1, \
                     started_at = COALESCE(started_at, ?2) \
                 WHERE session_id = ?3 AND step_id = ?4",
            )
            .bind(step.status.as_str())
            .bind((step.status != StepStatus::Todo).then(|| now.to_owned()))
            .bind(session_id)
            .bind(&step.step_id)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn advance_step_status(
    tx: &mut Tx<'_>,
    session_id: &str,
    step_id: &str,
    status: StepStatus,
    now: &str,
) -> Result<(), StoreError> {
    let step = PlanStep {
        step_id: step_id.to_owned(),
        title: String::new(),
        status,
        started_at: None,
    };
    let existing = sqlx::query("SELECT 1 AS x FROM plan_steps WHERE session_id = ?1 AND step_id = ?2")
        .bind(session_id)
        .bind(step_id)
        .fetch_optional(&mut **tx)
        .await?;
    if existing.is_none() {
        // Status for a step the plan never announced; record it rather
        // than dropping the update.
        let position = next_step_position(tx, session_id).await?;
        return upsert_step(tx, session_id, &step, position, now).await;
    }
    upsert_step(tx, session_id, &step, 0, now).await
}

/// Upsert a tool record: status only moves `doing` → `done`, and the
/// result summary fills in when it arrives.
async fn upsert_tool(
    tx: &mut Tx<'_>,
    session_id: &str,
    step_id: &str,
    record: &ToolRecord,
) -> Result<(), StoreError> {
    let existing = sqlx::query("SELECT status FROM tool_records WHERE session_id = ?1 AND tool_id = ?2")
        .bind(session_id)
        .bind(&record.tool_id)
        .fetch_optional(&mut **tx)
        .await?;

    if let Some(row) = existing {
        let current: String = row.try_get("status")?;
        if current == "done" {
            return Ok(());
        }
        sqlx::query(
            "UPDATE tool_records SET status = ?1, \
                 result_summary = CASE WHEN ?2 != '' THEN ?2 ELSE result_summary END \
             WHERE session_id = ?3 AND tool_id = ?4",
        )
        .bind(record.status.as_str())
        .bind(&record.result_summary)
        .bind(session_id)
        .bind(&record.tool_id)
        .execute(&mut **tx)
        .await?;
        return Ok(());
    }

    sqlx::query(
        "INSERT INTO tool_records \
             (session_id, step_id, tool_id, name, status, brief, action, target, result_summary) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )
    .bind(session_id)
    .bind(step_id)
    .bind(&record.tool_id)
    .bind(&record.name)
    .bind(record.status.as_str())
    .bind(&record.brief)
    .bind(&record.action)
    .bind(&record.target)
    .bind(&record.result_summary)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
