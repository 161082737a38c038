//! Download queue CRUD.

use crate::error::DatabaseError;
use crate::types::DownloadId;
use crate::utils::url_hash;
use crate::{Error, Result};
use std::path::Path;

use super::{Database, DownloadRow, NewDownload};

impl Database {
    /// Insert a new download and return its ID
    pub async fn insert_download(&self, new: &NewDownload) -> Result<DownloadId> {
        let mirrors = serde_json::to_string(&new.mirrors)?;
        let result = sqlx::query(
            r#"
            INSERT INTO downloads (url, url_hash, dest_path, filename, status, mirrors, created_at)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&new.url)
        .bind(url_hash(&new.url))
        .bind(new.dest_path.to_string_lossy().into_owned())
        .bind(&new.filename)
        .bind(mirrors)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(DownloadId(result.last_insert_rowid()))
    }

    /// Fetch a download by ID
    pub async fn get_download(&self, id: DownloadId) -> Result<Option<DownloadRow>> {
        sqlx::query_as::<_, DownloadRow>("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)
    }

    /// Update the status column
    pub async fn update_status(&self, id: DownloadId, status: i32) -> Result<()> {
        sqlx::query("UPDATE downloads SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Record the probe resolution: final destination path, filename, total size
    pub async fn update_resolution(
        &self,
        id: DownloadId,
        dest_path: &Path,
        filename: &str,
        total_size: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE downloads SET dest_path = ?, filename = ?, total_size = ? WHERE id = ?",
        )
        .bind(dest_path.to_string_lossy().into_owned())
        .bind(filename)
        .bind(total_size as i64)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    /// Record the downloaded-bytes counter
    pub async fn update_progress(&self, id: DownloadId, downloaded: u64) -> Result<()> {
        sqlx::query("UPDATE downloads SET downloaded = ? WHERE id = ?")
            .bind(downloaded as i64)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Set the error message column
    pub async fn set_error(&self, id: DownloadId, error: &str) -> Result<()> {
        let value = if error.is_empty() { None } else { Some(error) };
        sqlx::query("UPDATE downloads SET error_message = ? WHERE id = ?")
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Record the start timestamp (first session only)
    pub async fn set_started(&self, id: DownloadId) -> Result<()> {
        sqlx::query("UPDATE downloads SET started_at = COALESCE(started_at, ?) WHERE id = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// List all downloads, newest first
    pub async fn list_downloads(&self) -> Result<Vec<DownloadRow>> {
        sqlx::query_as::<_, DownloadRow>("SELECT * FROM downloads ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(query_err)
    }

    /// List downloads with a specific status
    pub async fn list_downloads_by_status(&self, status: i32) -> Result<Vec<DownloadRow>> {
        sqlx::query_as::<_, DownloadRow>(
            "SELECT * FROM downloads WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)
    }

    /// Downloads interrupted by the previous session (Queued or Downloading)
    pub async fn get_incomplete_downloads(&self) -> Result<Vec<DownloadRow>> {
        sqlx::query_as::<_, DownloadRow>(
            "SELECT * FROM downloads WHERE status IN (0, 1) ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)
    }

    /// Non-terminal downloads for the same URL (duplicate-add detection)
    pub async fn find_active_by_url(&self, url: &str) -> Result<Vec<DownloadRow>> {
        sqlx::query_as::<_, DownloadRow>(
            "SELECT * FROM downloads WHERE url_hash = ? AND status IN (0, 1, 2)",
        )
        .bind(url_hash(url))
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)
    }

    /// Delete a download (cascades to its remaining tasks)
    pub async fn delete_download(&self, id: DownloadId) -> Result<()> {
        let result = sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "Download {} not found",
                id
            ))));
        }
        Ok(())
    }
}

fn query_err(e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(e.to_string()))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;
    use std::path::PathBuf;

    async fn test_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("test.db")).await.unwrap();
        (db, dir)
    }

    fn sample(url: &str) -> NewDownload {
        NewDownload {
            url: url.to_string(),
            dest_path: PathBuf::from("/tmp/out"),
            filename: String::new(),
            mirrors: vec!["http://mirror.example/a".to_string()],
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trip() {
        let (db, _dir) = test_db().await;
        let id = db
            .insert_download(&sample("http://example.com/a.bin"))
            .await
            .unwrap();

        let row = db.get_download(id).await.unwrap().unwrap();
        assert_eq!(row.url, "http://example.com/a.bin");
        assert_eq!(row.status, Status::Queued.to_i32());
        assert_eq!(row.mirror_list(), vec!["http://mirror.example/a"]);
        assert_eq!(
            row.url_hash,
            url_hash("http://example.com/a.bin"),
            "url hash column must match the computed key"
        );
    }

    #[tokio::test]
    async fn resolution_updates_path_name_and_size() {
        let (db, _dir) = test_db().await;
        let id = db
            .insert_download(&sample("http://example.com/a.bin"))
            .await
            .unwrap();

        db.update_resolution(id, Path::new("/tmp/out/a.bin"), "a.bin", 1024)
            .await
            .unwrap();

        let row = db.get_download(id).await.unwrap().unwrap();
        assert_eq!(row.dest_path, "/tmp/out/a.bin");
        assert_eq!(row.filename, "a.bin");
        assert_eq!(row.total_size, 1024);
    }

    #[tokio::test]
    async fn find_active_by_url_ignores_terminal_rows() {
        let (db, _dir) = test_db().await;
        let id = db
            .insert_download(&sample("http://example.com/a.bin"))
            .await
            .unwrap();

        assert_eq!(
            db.find_active_by_url("http://example.com/a.bin")
                .await
                .unwrap()
                .len(),
            1
        );

        db.update_status(id, Status::Complete.to_i32())
            .await
            .unwrap();
        assert!(
            db.find_active_by_url("http://example.com/a.bin")
                .await
                .unwrap()
                .is_empty(),
            "completed downloads must not trigger duplicate conflicts"
        );
    }

    #[tokio::test]
    async fn delete_of_missing_download_errors() {
        let (db, _dir) = test_db().await;
        assert!(db.delete_download(DownloadId(4711)).await.is_err());
    }

    #[tokio::test]
    async fn set_started_keeps_first_timestamp() {
        let (db, _dir) = test_db().await;
        let id = db
            .insert_download(&sample("http://example.com/a.bin"))
            .await
            .unwrap();

        db.set_started(id).await.unwrap();
        let first = db.get_download(id).await.unwrap().unwrap().started_at;
        assert!(first.is_some());

        db.set_started(id).await.unwrap();
        let second = db.get_download(id).await.unwrap().unwrap().started_at;
        assert_eq!(first, second, "started_at must survive resume sessions");
    }
}
