//! SSE endpoint: replay persisted events by sequence, then stream live.
//!
//! The subscriber is bound to the request context -- when the client goes
//! away the stream stops, but persistence and the task itself continue.
//! Reconnecting replays the same prefix (by seq) and then continues.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::api::{caller, readable_session};
use super::error::ApiError;
use super::AppState;
use crate::types::{valid_session_id, SessionEvent};

/// GET /tasks/:session_id/events -- the session's ordered event stream.
pub async fn session_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if !valid_session_id(&session_id) {
        return Err(ApiError::Validation("invalid session id".to_owned()));
    }
    let username = caller(&state, &headers);
    readable_session(&state, &session_id, &username).await?;

    let (replay, live) = state.bus.subscribe(&session_id).await?;
    debug!(session_id, replayed = replay.len(), "sse subscriber attached");

    let stream = stream::iter(replay)
        .chain(ReceiverStream::new(live))
        .map(|event| Ok(to_sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: &SessionEvent) -> Event {
    let payload = json!({
        "seq": event.seq,
        "type": event.event_type,
        "content": event.content,
    });
    Event::default().data(payload.to_string())
}
