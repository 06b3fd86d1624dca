//! SQLite persistence for sessions, events, plans, tools, and attachments.
//!
//! Reads go directly through the pool. Event-frame writes are wrapped in a
//! transaction that updates the event row, the session row, and any plan or
//! tool side effects atomically, so a crash never leaves a frame half
//! applied. Session operations are low-frequency and use direct queries.

pub mod attachments;
pub mod events;
pub mod plans;
pub mod sessions;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::types::InvalidEnum;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    /// A stored enum column held an unrecognised value.
    #[error(transparent)]
    InvalidEnum(#[from] InvalidEnum),
    /// A stored JSON column failed to parse.
    #[error("corrupt stored JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Handle to the relational store.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (and create if missing) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot
    /// be applied.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A single connection: every pool connection would otherwise get
        // its own empty in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// Shared connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

/// Current UTC timestamp in the stored text form.
pub(crate) fn now_text() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── SQL schema ──────────────────────────────────────────────────

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id  TEXT PRIMARY KEY,
    username    TEXT NOT NULL,
    title       TEXT NOT NULL,
    task_kind   TEXT NOT NULL,
    status      TEXT NOT NULL,
    content     TEXT NOT NULL DEFAULT '',
    params      TEXT,
    language    TEXT NOT NULL DEFAULT 'en',
    shared      INTEGER NOT NULL DEFAULT 0,
    error       TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_username ON sessions(username, created_at);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

CREATE TABLE IF NOT EXISTS events (
    session_id  TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    event_type  TEXT NOT NULL,
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (session_id, seq)
);

CREATE TABLE IF NOT EXISTS plan_steps (
    session_id  TEXT NOT NULL,
    step_id     TEXT NOT NULL,
    position    INTEGER NOT NULL,
    title       TEXT NOT NULL,
    status      TEXT NOT NULL,
    started_at  TEXT,
    PRIMARY KEY (session_id, step_id)
);

CREATE TABLE IF NOT EXISTS tool_records (
    session_id      TEXT NOT NULL,
    step_id         TEXT NOT NULL,
    tool_id         TEXT NOT NULL,
    name            TEXT NOT NULL,
    status          TEXT NOT NULL,
    brief           TEXT NOT NULL DEFAULT '',
    action          TEXT NOT NULL DEFAULT '',
    target          TEXT NOT NULL DEFAULT '',
    result_summary  TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (session_id, tool_id)
);

CREATE TABLE IF NOT EXISTS tool_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  TEXT NOT NULL,
    step_id     TEXT NOT NULL,
    tool_id     TEXT NOT NULL,
    action_id   TEXT NOT NULL,
    text        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tool_logs_session ON tool_logs(session_id);

CREATE TABLE IF NOT EXISTS results (
    session_id  TEXT PRIMARY KEY,
    result      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attachments (
    file_url       TEXT PRIMARY KEY,
    username       TEXT NOT NULL,
    original_name  TEXT NOT NULL,
    disk_path      TEXT NOT NULL,
    size           INTEGER NOT NULL,
    mime           TEXT NOT NULL DEFAULT '',
    session_id     TEXT,
    created_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attachments_session ON attachments(session_id);

CREATE TABLE IF NOT EXISTS agents_last_seen (
    agent_id            TEXT PRIMARY KEY,
    hostname            TEXT NOT NULL,
    ip                  TEXT NOT NULL,
    version             TEXT NOT NULL,
    capabilities        TEXT NOT NULL,
    connected_at        TEXT NOT NULL,
    last_heartbeat_at   TEXT NOT NULL
);
"#;
