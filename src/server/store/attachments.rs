//! Attachment rows: uploaded files and their session bindings.
//!
//! Files are uploaded before the task referencing them exists; the upload
//! row carries the owner, and task creation binds the file to a session.
//! Download access is gated on the owning session, not the raw file.

use sqlx::Row;

use super::{now_text, Store, StoreError};

/// A stored attachment.
#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    /// Public file URL handed back to the client.
    pub file_url: String,
    /// Uploading user.
    pub username: String,
    /// Original (client) file name.
    pub original_name: String,
    /// On-disk path under the uploads directory.
    pub disk_path: String,
    /// File size in bytes.
    pub size: i64,
    /// Detected or declared MIME type.
    pub mime: String,
    /// Session the file is bound to, once a task references it.
    pub session_id: Option<String>,
}

impl Store {
    /// Record an uploaded file.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn insert_attachment(&self, record: &AttachmentRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO attachments \
                 (file_url, username, original_name, disk_path, size, mime, session_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&record.file_url)
        .bind(&record.username)
        .bind(&record.original_name)
        .bind(&record.disk_path)
        .bind(record.size)
        .bind(&record.mime)
        .bind(&record.session_id)
        .bind(now_text())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetch an attachment by public URL.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn get_attachment(
        &self,
        file_url: &str,
    ) -> Result<Option<AttachmentRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT file_url, username, original_name, disk_path, size, mime, session_id \
             FROM attachments WHERE file_url = ?1",
        )
        .bind(file_url)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(AttachmentRecord {
                file_url: row.try_get("file_url")?,
                username: row.try_get("username")?,
                original_name: row.try_get("original_name")?,
                disk_path: row.try_get("disk_path")?,
                size: row.try_get("size")?,
                mime: row.try_get("mime")?,
                session_id: row.try_get("session_id")?,
            })
        })
        .transpose()
    }

    /// Bind an uploaded file to a session. Returns `false` when the file
    /// does not exist or belongs to another user.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn bind_attachment(
        &self,
        file_url: &str,
        username: &str,
        session_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE attachments SET session_id = ?1 \
             WHERE file_url = ?2 AND username = ?3",
        )
        .bind(session_id)
        .bind(file_url)
        .bind(username)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
