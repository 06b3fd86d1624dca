//! REST handlers for the task lifecycle.
//!
//! Every handler resolves the caller's username from the auth-proxy header
//! (falling back to the configured default user), enforces ownership, and
//! answers inside the uniform envelope. Session ids are client-chosen and
//! validated against `^[A-Za-z0-9_-]{1,50}$` at this boundary.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::error::{ok, ok_empty, ApiError, Envelope};
use super::registry::AgentView;
use super::store::events::FrameSideEffect;
use super::store::plans::{StoredTool, StoredToolLog};
use super::store::sessions::SessionRecord;
use super::AppState;
use crate::protocol::TaskRequest;
use crate::types::{
    valid_session_id, EventType, Language, PlanStep, SessionEvent, TaskKind,
};

/// Maximum accepted title length on update.
const MAX_TITLE_CHARS: usize = 100;

/// Characters of content used for the derived session title.
const TITLE_FROM_CONTENT_CHARS: usize = 60;

/// Resolve the caller's username from the configured header.
pub fn caller(state: &AppState, headers: &HeaderMap) -> String {
    headers
        .get(state.config.listen.user_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(&state.config.listen.default_user)
        .to_owned()
}

/// Fetch a session and require the caller to own it.
async fn owned_session(
    state: &AppState,
    session_id: &str,
    username: &str,
) -> Result<SessionRecord, ApiError> {
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session not found".to_owned()))?;
    if session.username != username {
        return Err(ApiError::Forbidden);
    }
    Ok(session)
}

/// Fetch a session readable by the caller (owner, or anyone if shared).
pub(super) async fn readable_session(
    state: &AppState,
    session_id: &str,
    username: &str,
) -> Result<SessionRecord, ApiError> {
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session not found".to_owned()))?;
    if session.username != username && !session.shared {
        return Err(ApiError::Forbidden);
    }
    Ok(session)
}

// ── createTask ──────────────────────────────────────────────────

/// POST /tasks body.
#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    /// Client-chosen session id.
    pub session_id: String,
    /// Task kind name.
    pub task: String,
    /// Primary user input.
    #[serde(default)]
    pub content: String,
    /// Opaque handler parameters.
    #[serde(default)]
    pub params: Value,
    /// Previously uploaded file URLs.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Response language (`zh` or `en`).
    #[serde(default)]
    pub language: Option<String>,
}

/// POST /tasks response payload.
#[derive(Debug, Serialize)]
pub struct CreatedTask {
    /// Echoed session id.
    pub session_id: String,
    /// Derived session title.
    pub title: String,
}

/// Create and dispatch a task.
pub async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskBody>,
) -> Result<Json<Envelope<CreatedTask>>, ApiError> {
    let username = caller(&state, &headers);

    if !valid_session_id(&body.session_id) {
        return Err(ApiError::Validation("invalid session id".to_owned()));
    }
    let task_kind = TaskKind::parse(&body.task)
        .map_err(|_| ApiError::Validation(format!("unknown task kind {:?}", body.task)))?;
    if body.content.trim().is_empty() {
        return Err(ApiError::Validation("content must not be empty".to_owned()));
    }
    let language = match body.language.as_deref() {
        None | Some("") | Some("en") => Language::En,
        Some("zh") => Language::Zh,
        Some(other) => {
            return Err(ApiError::Validation(format!("unknown language {other:?}")));
        }
    };

    if state.store.get_session(&body.session_id).await?.is_some() {
        return Err(ApiError::Conflict(
            "session already exists; re-run under a new session id".to_owned(),
        ));
    }

    let live = state.store.count_live_sessions(&username).await?;
    if live >= i64::from(state.config.tasks.max_live_sessions_per_user) {
        return Err(ApiError::Conflict("quota_exceeded".to_owned()));
    }

    let title = derive_title(&body.content);
    let params_text = if body.params.is_null() {
        None
    } else {
        Some(body.params.to_string())
    };

    state
        .store
        .create_session(
            &body.session_id,
            &username,
            &title,
            task_kind,
            &body.content,
            params_text.as_deref(),
            language,
        )
        .await?;

    // Attachments must exist and belong to the caller at dispatch time.
    for file_url in &body.attachments {
        let bound = state
            .store
            .bind_attachment(file_url, &username, &body.session_id)
            .await?;
        if !bound {
            state.store.delete_session(&body.session_id).await?;
            return Err(ApiError::Validation(format!(
                "attachment {file_url:?} not found"
            )));
        }
    }

    // Seq 0: the acceptance marker every subscriber replays first.
    state
        .bus
        .publish(
            &body.session_id,
            EventType::ToolUseLog,
            json!({"action_id": "", "tool": "", "plan_step_id": "", "text": "task accepted"}),
            FrameSideEffect::None,
        )
        .await?;

    info!(session_id = %body.session_id, username, kind = task_kind.as_str(), "task created");

    let request = TaskRequest {
        session_id: body.session_id.clone(),
        task_kind,
        params: body.params,
        content: body.content,
        attachments: body.attachments,
        language,
    };
    state.dispatcher.dispatch(request).await;

    Ok(ok(CreatedTask {
        session_id: body.session_id,
        title,
    }))
}

fn derive_title(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or("").trim();
    first_line.chars().take(TITLE_FROM_CONTENT_CHARS).collect()
}

// ── terminate / update / delete / share ─────────────────────────

/// POST /tasks/:session_id/terminate -- owner cancels a live task.
pub async fn terminate_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Envelope<Value>>, ApiError> {
    let username = caller(&state, &headers);
    let session = owned_session(&state, &session_id, &username).await?;
    if session.status.is_terminal() {
        return Err(ApiError::Conflict("session already terminal".to_owned()));
    }
    state.dispatcher.terminate(&session_id).await;
    Ok(ok_empty())
}

/// PATCH /tasks/:session_id body.
#[derive(Debug, Deserialize)]
pub struct UpdateTaskBody {
    /// New title.
    pub title: Option<String>,
}

/// PATCH /tasks/:session_id -- owner updates the title.
pub async fn update_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<UpdateTaskBody>,
) -> Result<Json<Envelope<Value>>, ApiError> {
    let username = caller(&state, &headers);
    owned_session(&state, &session_id, &username).await?;
    if let Some(title) = body.title {
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(ApiError::Validation(format!(
                "title longer than {MAX_TITLE_CHARS} characters"
            )));
        }
        state.store.set_session_title(&session_id, &title).await?;
    }
    Ok(ok_empty())
}

/// DELETE /tasks/:session_id -- owner deletes the session and its history.
pub async fn delete_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Envelope<Value>>, ApiError> {
    let username = caller(&state, &headers);
    let session = owned_session(&state, &session_id, &username).await?;
    if !session.status.is_terminal() {
        state.dispatcher.terminate(&session_id).await;
    }
    state.bus.forget(&session_id).await;
    state.store.delete_session(&session_id).await?;
    info!(session_id, username, "session deleted");
    Ok(ok_empty())
}

/// POST /tasks/:session_id/share -- owner opens the session for reading.
pub async fn share_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Envelope<Value>>, ApiError> {
    let username = caller(&state, &headers);
    owned_session(&state, &session_id, &username).await?;
    state.store.set_session_shared(&session_id).await?;
    Ok(ok_empty())
}

// ── detail & list ───────────────────────────────────────────────

/// GET /tasks/:session_id payload.
#[derive(Debug, Serialize)]
pub struct TaskDetail {
    /// The session row.
    pub session: SessionRecord,
    /// Full ordered event log.
    pub events: Vec<SessionEvent>,
    /// Plan steps.
    pub plan: Vec<PlanStep>,
    /// Tool records.
    pub tools: Vec<StoredTool>,
    /// Tool log lines.
    pub logs: Vec<StoredToolLog>,
    /// Final result, when recorded.
    pub result: Option<Value>,
}

/// GET /tasks/:session_id -- full session detail.
pub async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Envelope<TaskDetail>>, ApiError> {
    let username = caller(&state, &headers);
    let session = readable_session(&state, &session_id, &username).await?;
    let events = state.store.events_from(&session_id, 0).await?;
    let plan = state.store.plan_steps(&session_id).await?;
    let tools = state.store.tool_records(&session_id).await?;
    let logs = state.store.tool_logs(&session_id).await?;
    let result = state.store.result(&session_id).await?;
    Ok(ok(TaskDetail {
        session,
        events,
        plan,
        tools,
        logs,
        result,
    }))
}

/// GET /tasks query parameters.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Title/content substring filter.
    #[serde(default)]
    pub q: Option<String>,
    /// Task kind filter.
    #[serde(default, rename = "taskType")]
    pub task_type: Option<String>,
    /// 1-based page.
    #[serde(default)]
    pub page: Option<u32>,
    /// Page size (max 100).
    #[serde(default, rename = "pageSize")]
    pub page_size: Option<u32>,
}

/// GET /tasks payload.
#[derive(Debug, Serialize)]
pub struct TaskList {
    /// Sessions on this page, newest first.
    pub tasks: Vec<SessionRecord>,
    /// Echoed page number.
    pub page: u32,
    /// Echoed page size.
    pub page_size: u32,
}

/// GET /tasks -- the caller's sessions.
pub async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Envelope<TaskList>>, ApiError> {
    let username = caller(&state, &headers);
    let kind = match query.task_type.as_deref() {
        None | Some("") => None,
        Some(name) => Some(
            TaskKind::parse(name)
                .map_err(|_| ApiError::Validation(format!("unknown task kind {name:?}")))?,
        ),
    };
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(20).clamp(1, 100);
    let offset = i64::from(page.saturating_sub(1)).saturating_mul(i64::from(page_size));

    let tasks = state
        .store
        .list_sessions(
            &username,
            kind,
            query.q.as_deref().filter(|q| !q.is_empty()),
            i64::from(page_size),
            offset,
        )
        .await?;
    Ok(ok(TaskList {
        tasks,
        page,
        page_size,
    }))
}

// ── agents ──────────────────────────────────────────────────────

/// GET /agents -- connected workers.
pub async fn list_agents(
    State(state): State<AppState>,
) -> Result<Json<Envelope<Vec<AgentView>>>, ApiError> {
    Ok(ok(state.registry.snapshot()))
}
