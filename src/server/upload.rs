//! Attachment upload and ownership-gated download.
//!
//! Uploaded files land in a shared directory under a hash+timestamp name,
//! so client-chosen names never touch the filesystem. Download goes
//! through the owning session: the file must be bound to the session the
//! caller is reading.

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use super::api::{caller, readable_session};
use super::error::{ok, ApiError, Envelope};
use super::store::attachments::AttachmentRecord;
use super::AppState;
use crate::types::valid_file_name;

/// POST /upload payload.
#[derive(Debug, Serialize)]
pub struct UploadedFile {
    /// Public file URL to reference in task attachments.
    pub file_url: String,
    /// Stored size in bytes.
    pub size: u64,
    /// Declared MIME type.
    pub mime: String,
}

/// POST /upload -- store a multipart `file` field.
pub async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Envelope<UploadedFile>>, ApiError> {
    let username = caller(&state, &headers);

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::Validation("malformed multipart body".to_owned()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let original_name = field.file_name().unwrap_or("").to_owned();
        if original_name.is_empty() {
            return Err(ApiError::Validation("empty file name".to_owned()));
        }
        if !valid_file_name(&original_name) {
            return Err(ApiError::Validation("illegal file name".to_owned()));
        }
        let mime = field.content_type().unwrap_or("").to_owned();
        let bytes = field
            .bytes()
            .await
            .map_err(|_| ApiError::Validation("failed to read upload".to_owned()))?;
        if u64::try_from(bytes.len()).unwrap_or(u64::MAX) > state.config.storage.max_upload_bytes {
            return Err(ApiError::Validation("file too large".to_owned()));
        }

        let stored_name = hashed_name(&original_name);
        let uploads_dir = &state.config.storage.uploads_dir;
        std::fs::create_dir_all(uploads_dir)
            .map_err(|e| ApiError::Io(format!("cannot create uploads dir: {e}")))?;
        let disk_path = uploads_dir.join(&stored_name);
        tokio::fs::write(&disk_path, &bytes)
            .await
            .map_err(|e| ApiError::Io(format!("cannot store upload: {e}")))?;

        let file_url = format!("/files/{stored_name}");
        let record = AttachmentRecord {
            file_url: file_url.clone(),
            username: username.clone(),
            original_name,
            disk_path: disk_path.display().to_string(),
            size: i64::try_from(bytes.len()).unwrap_or(i64::MAX),
            mime: mime.clone(),
            session_id: None,
        };
        state.store.insert_attachment(&record).await?;
        info!(username, file_url, size = bytes.len(), "file uploaded");

        return Ok(ok(UploadedFile {
            file_url,
            size: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            mime,
        }));
    }

    Err(ApiError::Validation("missing file field".to_owned()))
}

/// Hash+timestamp on-disk name; the original name never reaches the
/// filesystem. A process-local counter keeps same-microsecond uploads of
/// one name apart.
fn hashed_name(original_name: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let timestamp = chrono::Utc::now().timestamp_micros();
    let nonce = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(original_name.as_bytes());
    hasher.update(timestamp.to_le_bytes());
    hasher.update(nonce.to_le_bytes());
    let digest = hasher.finalize();
    let extension = std::path::Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    format!("{}_{timestamp}{extension}", hex::encode(&digest[..8]))
}

/// POST /tasks/:session_id/download body.
#[derive(Debug, Deserialize)]
pub struct DownloadBody {
    /// File URL returned by upload.
    pub file_url: String,
}

/// POST /tasks/:session_id/download -- bytes of a file bound to the session.
pub async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<DownloadBody>,
) -> Result<Response, ApiError> {
    let username = caller(&state, &headers);
    // Sharing a session shares its attachments: the detail view already
    // exposes the file URLs, so read access follows the session flag.
    readable_session(&state, &session_id, &username).await?;

    let attachment = state
        .store
        .get_attachment(&body.file_url)
        .await?
        .ok_or_else(|| ApiError::NotFound("file not found".to_owned()))?;
    if attachment.session_id.as_deref() != Some(session_id.as_str()) {
        return Err(ApiError::NotFound("file not attached to this task".to_owned()));
    }

    let bytes = tokio::fs::read(&attachment.disk_path)
        .await
        .map_err(|_| ApiError::NotFound("file content missing".to_owned()))?;

    let mime = if attachment.mime.is_empty() {
        "application/octet-stream".to_owned()
    } else {
        attachment.mime.clone()
    };
    let disposition = format!(
        "attachment; filename=\"{}\"",
        attachment.original_name.replace('"', "")
    );
    Ok((
        [
            (header::CONTENT_TYPE, mime),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from(bytes),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_names_are_collision_resistant_and_clean() {
        let a = hashed_name("report.pdf");
        let b = hashed_name("report.pdf");
        assert_ne!(a, b, "timestamp must separate identical names");
        assert!(a.ends_with(".pdf"));
        assert!(!a.contains('/'));

        let odd = hashed_name("weird.name.tar.gz!");
        assert!(!odd.contains('!'));
    }
}
