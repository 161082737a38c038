//! Completed and failed download records.

use crate::error::DatabaseError;
use crate::types::{DownloadId, Status};
use crate::{Error, Result};

use super::{Database, DownloadRow};

impl Database {
    /// Mark a download as completed and record its final stats.
    ///
    /// The row stays in the `downloads` table with a terminal status; history
    /// queries filter on that.
    pub async fn record_completed(
        &self,
        id: DownloadId,
        total_size: u64,
        time_taken_ms: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE downloads
            SET status = ?, downloaded = ?, total_size = ?, completed_at = ?,
                time_taken_ms = ?, error_message = NULL
            WHERE id = ?
            "#,
        )
        .bind(Status::Complete.to_i32())
        .bind(total_size as i64)
        .bind(total_size as i64)
        .bind(chrono::Utc::now().timestamp())
        .bind(time_taken_ms as i64)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        // The resume payload is no longer needed
        self.delete_state(id).await
    }

    /// Mark a download as failed with an error message
    pub async fn record_failed(&self, id: DownloadId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE downloads
            SET status = ?, completed_at = ?, error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(Status::Failed.to_i32())
        .bind(chrono::Utc::now().timestamp())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    /// Terminal downloads, most recently finished first
    pub async fn history(&self) -> Result<Vec<DownloadRow>> {
        sqlx::query_as::<_, DownloadRow>(
            r#"
            SELECT * FROM downloads
            WHERE status IN (3, 4)
            ORDER BY completed_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)
    }
}

fn query_err(e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(e.to_string()))
}
