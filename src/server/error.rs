//! API error kinds and the uniform response envelope.
//!
//! Application errors travel inside the envelope (`status: 1`) with a kind
//! and a short human-readable description; HTTP status stays 200 so thin
//! clients only ever parse one shape. Internals -- stack traces, file
//! paths, SQL -- never reach the client.

use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::store::StoreError;

/// Uniform response envelope: `{status: 0|1, message, data?}`.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    /// 0 on success, 1 on application error.
    pub status: u8,
    /// Human-readable message; "ok" on success.
    pub message: String,
    /// Payload, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// Successful envelope with a payload.
pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        status: 0,
        message: "ok".to_owned(),
        data: Some(data),
    })
}

/// Successful envelope with no payload.
pub fn ok_empty() -> Json<Envelope<serde_json::Value>> {
    Json(Envelope {
        status: 0,
        message: "ok".to_owned(),
        data: None,
    })
}

/// User-visible API errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed input: session id, file name, empty content.
    #[error("validation_error: {0}")]
    Validation(String),
    /// Caller does not own the session.
    #[error("forbidden: not the session owner")]
    Forbidden,
    /// Session, file, or resource absent.
    #[error("not_found: {0}")]
    NotFound(String),
    /// Session already terminal, duplicate id, or quota exceeded.
    #[error("conflict: {0}")]
    Conflict(String),
    /// No agent advertises the required capability.
    #[error("agent_unavailable: no worker can run this task kind")]
    AgentUnavailable,
    /// Transient storage or filesystem failure.
    #[error("io_error: {0}")]
    Io(String),
}

impl ApiError {
    /// Short machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::AgentUnavailable => "agent_unavailable",
            Self::Io(_) => "io_error",
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "store error");
        Self::Io("storage failure".to_owned())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope: Envelope<serde_json::Value> = Envelope {
            status: 1,
            message: self.to_string(),
            data: None,
        };
        Json(envelope).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ApiError::Forbidden.kind(), "forbidden");
        assert_eq!(
            ApiError::Validation("bad id".to_owned()).kind(),
            "validation_error"
        );
        assert_eq!(
            ApiError::Validation("bad id".to_owned()).to_string(),
            "validation_error: bad id"
        );
    }
}
