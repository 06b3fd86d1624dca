//! Session rows: creation, status transitions, listing.
//!
//! Terminal statuses are immutable: every transition query carries a
//! `status NOT IN (...)` guard so a late frame can never resurrect a
//! finished session.

use sqlx::Row;

use super::{now_text, Store, StoreError};
use crate::types::{Language, SessionStatus, TaskKind};

/// A stored session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionRecord {
    /// Client-chosen session id.
    pub session_id: String,
    /// Owning username.
    pub username: String,
    /// Display title.
    pub title: String,
    /// Task kind bound to this session.
    pub task_kind: TaskKind,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Primary user input.
    pub content: String,
    /// Opaque handler parameters (JSON text).
    pub params: Option<String>,
    /// Requested response language.
    pub language: Language,
    /// Whether the session is readable by other users.
    pub shared: bool,
    /// Terminal error text, when failed.
    pub error: Option<String>,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last update timestamp (RFC 3339).
    pub updated_at: String,
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRecord, StoreError> {
    let task_kind: String = row.try_get("task_kind")?;
    let status: String = row.try_get("status")?;
    let language: String = row.try_get("language")?;
    Ok(SessionRecord {
        session_id: row.try_get("session_id")?,
        username: row.try_get("username")?,
        title: row.try_get("title")?,
        task_kind: TaskKind::parse(&task_kind)?,
        status: SessionStatus::parse(&status)?,
        content: row.try_get("content")?,
        params: row.try_get("params")?,
        language: if language == "zh" { Language::Zh } else { Language::En },
        shared: row.try_get::<i64, _>("shared")? != 0,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SESSION_COLUMNS: &str = "session_id, username, title, task_kind, status, content, params, \
                               language, shared, error, created_at, updated_at";

impl Store {
    /// Insert a new session in `accepted` state.
    ///
    /// # Errors
    ///
    /// Returns an error on conflict with an existing session id or any
    /// database failure.
    pub async fn create_session(
        &self,
        session_id: &str,
        username: &str,
        title: &str,
        task_kind: TaskKind,
        content: &str,
        params: Option<&str>,
        language: Language,
    ) -> Result<(), StoreError> {
        let now = now_text();
        sqlx::query(
            "INSERT INTO sessions (session_id, username, title, task_kind, status, content, \
                                   params, language, shared, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'accepted', ?5, ?6, ?7, 0, ?8, ?8)",
        )
        .bind(session_id)
        .bind(username)
        .bind(title)
        .bind(task_kind.as_str())
        .bind(content)
        .bind(params)
        .bind(language.as_str())
        .bind(&now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetch a session by id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"
        ))
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Transition a session's status, refusing to touch terminal sessions.
    ///
    /// Returns `true` when a row changed.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET status = ?1, updated_at = ?2 \
             WHERE session_id = ?3 AND status NOT IN ('done', 'failed', 'terminated')",
        )
        .bind(status.as_str())
        .bind(now_text())
        .bind(session_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a session failed with an error description.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn fail_session(&self, session_id: &str, error: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET status = 'failed', error = ?1, updated_at = ?2 \
             WHERE session_id = ?3 AND status NOT IN ('done', 'failed', 'terminated')",
        )
        .bind(error)
        .bind(now_text())
        .bind(session_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Update the display title.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn set_session_title(&self, session_id: &str, title: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET title = ?1, updated_at = ?2 WHERE session_id = ?3")
            .bind(title)
            .bind(now_text())
            .bind(session_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Mark a session shared (readable by any authenticated user).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn set_session_shared(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET shared = 1, updated_at = ?1 WHERE session_id = ?2")
            .bind(now_text())
            .bind(session_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete a session and all dependent rows.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;
        for table in [
            "events",
            "plan_steps",
            "tool_records",
            "tool_logs",
            "results",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE session_id = ?1"))
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE attachments SET session_id = NULL WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Count a user's live (non-terminal) sessions.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn count_live_sessions(&self, username: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sessions \
             WHERE username = ?1 AND status NOT IN ('done', 'failed', 'terminated')",
        )
        .bind(username)
        .fetch_one(self.pool())
        .await?;
        Ok(row.try_get("n")?)
    }

    /// List a user's sessions, newest first, with optional kind and
    /// substring filters.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn list_sessions(
        &self,
        username: &str,
        task_kind: Option<TaskKind>,
        query: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let mut sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE username = ?");
        if task_kind.is_some() {
            sql.push_str(" AND task_kind = ?");
        }
        if query.is_some() {
            sql.push_str(" AND (title LIKE ? OR content LIKE ?)");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut statement = sqlx::query(&sql).bind(username);
        if let Some(kind) = task_kind {
            statement = statement.bind(kind.as_str());
        }
        if let Some(q) = query {
            let pattern = format!("%{q}%");
            statement = statement.bind(pattern.clone()).bind(pattern);
        }
        let rows = statement
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Record an agent connection for observability.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn upsert_agent_seen(
        &self,
        agent_id: &str,
        hostname: &str,
        ip: &str,
        version: &str,
        capabilities: &str,
    ) -> Result<(), StoreError> {
        let now = now_text();
        sqlx::query(
            "INSERT INTO agents_last_seen \
                 (agent_id, hostname, ip, version, capabilities, connected_at, last_heartbeat_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT(agent_id) DO UPDATE SET \
                 hostname = excluded.hostname, ip = excluded.ip, version = excluded.version, \
                 capabilities = excluded.capabilities, last_heartbeat_at = excluded.last_heartbeat_at",
        )
        .bind(agent_id)
        .bind(hostname)
        .bind(ip)
        .bind(version)
        .bind(capabilities)
        .bind(&now)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
