//! Pause-record persistence for cross-restart resume.
//!
//! A resume record is keyed by `(sha256(url), dest_path)` and stores the
//! exact remaining work: task list, counters, elapsed time, mirrors, and the
//! chunk bitmap that lets consumers draw progress consistently after a
//! restart. A successful save survives process crash (WAL + transaction).

use crate::error::DatabaseError;
use crate::types::{DownloadId, DownloadState, Task};
use crate::utils::url_hash;
use crate::{Error, Result};
use std::path::Path;

use super::{Database, DownloadRow, TaskRow};

impl Database {
    /// Persist a pause record.
    ///
    /// Replaces the stored task list and counters for the download row in one
    /// transaction so a crash can never leave tasks half-written.
    pub async fn save_state(&self, state: &DownloadState) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let mirrors = serde_json::to_string(&state.mirrors)?;
        let updated = sqlx::query(
            r#"
            UPDATE downloads
            SET total_size = ?, downloaded = ?, elapsed_ns = ?, mirrors = ?,
                chunk_bitmap = ?, chunk_size = ?, filename = ?, paused_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.total_size as i64)
        .bind(state.downloaded as i64)
        .bind(state.elapsed_ns)
        .bind(mirrors)
        .bind(&state.chunk_bitmap)
        .bind(state.chunk_size as i64)
        .bind(&state.filename)
        .bind(chrono::Utc::now().timestamp())
        .bind(state.id)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        if updated.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "Download {} not found",
                state.id
            ))));
        }

        sqlx::query("DELETE FROM tasks WHERE download_id = ?")
            .bind(state.id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        for task in &state.tasks {
            sqlx::query(
                "INSERT INTO tasks (download_id, start_offset, byte_length) VALUES (?, ?, ?)",
            )
            .bind(state.id)
            .bind(task.offset as i64)
            .bind(task.length as i64)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    /// Load the resume record for `(url, dest_path)`.
    ///
    /// Returns `None` when no record exists or when the record has no
    /// remaining tasks (nothing to resume).
    pub async fn load_state(&self, url: &str, dest_path: &Path) -> Result<Option<DownloadState>> {
        let row = sqlx::query_as::<_, DownloadRow>(
            r#"
            SELECT * FROM downloads
            WHERE url_hash = ? AND dest_path = ? AND status IN (0, 1, 2)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(url_hash(url))
        .bind(dest_path.to_string_lossy().into_owned())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tasks = self.load_tasks(DownloadId(row.id)).await?;
        if tasks.is_empty() {
            return Ok(None);
        }

        Ok(Some(DownloadState {
            url: row.url.clone(),
            id: DownloadId(row.id),
            dest_path: dest_path.to_path_buf(),
            total_size: row.total_size as u64,
            downloaded: row.downloaded as u64,
            tasks,
            filename: row.filename.clone(),
            elapsed_ns: row.elapsed_ns,
            mirrors: row.mirror_list(),
            chunk_bitmap: row.chunk_bitmap.clone().unwrap_or_default(),
            chunk_size: row.chunk_size as u64,
        }))
    }

    /// Remaining task ranges for a download, in offset order
    pub async fn load_tasks(&self, id: DownloadId) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT download_id, start_offset, byte_length FROM tasks WHERE download_id = ? ORDER BY start_offset ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(rows
            .into_iter()
            .map(|r| Task::new(r.start_offset as u64, r.byte_length as u64))
            .collect())
    }

    /// Delete the resume payload after successful completion.
    ///
    /// The download row itself survives as history; only the remaining tasks
    /// and the bitmap snapshot are cleared.
    pub async fn delete_state(&self, id: DownloadId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        sqlx::query("DELETE FROM tasks WHERE download_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        sqlx::query("UPDATE downloads SET chunk_bitmap = NULL, chunk_size = 0 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
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
    use crate::db::NewDownload;
    use std::path::PathBuf;

    async fn test_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("test.db")).await.unwrap();
        (db, dir)
    }

    async fn insert(db: &Database, url: &str, dest: &str) -> DownloadId {
        db.insert_download(&NewDownload {
            url: url.to_string(),
            dest_path: PathBuf::from(dest),
            filename: "a.bin".to_string(),
            mirrors: vec![],
        })
        .await
        .unwrap()
    }

    fn state_for(id: DownloadId, url: &str, dest: &str) -> DownloadState {
        DownloadState {
            url: url.to_string(),
            id,
            dest_path: PathBuf::from(dest),
            total_size: 20 * 1024 * 1024,
            downloaded: 5 * 1024 * 1024,
            tasks: vec![
                Task::new(5 * 1024 * 1024, 7 * 1024 * 1024),
                Task::new(12 * 1024 * 1024, 8 * 1024 * 1024),
            ],
            filename: "a.bin".to_string(),
            elapsed_ns: 1_500_000_000,
            mirrors: vec!["http://mirror.example/a.bin".to_string()],
            chunk_bitmap: vec![0b0000_0011],
            chunk_size: 2 * 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn save_and_load_preserve_the_exact_remaining_work() {
        let (db, _dir) = test_db().await;
        let url = "http://example.com/a.bin";
        let dest = "/tmp/a.bin";
        let id = insert(&db, url, dest).await;

        let state = state_for(id, url, dest);
        db.save_state(&state).await.unwrap();

        let loaded = db.load_state(url, Path::new(dest)).await.unwrap().unwrap();
        assert_eq!(loaded.tasks, state.tasks, "task list must round-trip exactly");
        assert_eq!(loaded.downloaded, state.downloaded);
        assert_eq!(loaded.total_size, state.total_size);
        assert_eq!(loaded.elapsed_ns, state.elapsed_ns);
        assert_eq!(loaded.chunk_bitmap, state.chunk_bitmap);
        assert_eq!(loaded.chunk_size, state.chunk_size);
        assert_eq!(loaded.mirrors, state.mirrors);
        assert_eq!(
            loaded.downloaded + loaded.remaining_bytes(),
            loaded.total_size,
            "resume fidelity: downloaded + remaining == total"
        );
    }

    #[tokio::test]
    async fn save_replaces_previous_task_list() {
        let (db, _dir) = test_db().await;
        let url = "http://example.com/a.bin";
        let dest = "/tmp/a.bin";
        let id = insert(&db, url, dest).await;

        db.save_state(&state_for(id, url, dest)).await.unwrap();

        let mut second = state_for(id, url, dest);
        second.tasks = vec![Task::new(10 * 1024 * 1024, 10 * 1024 * 1024)];
        second.downloaded = 10 * 1024 * 1024;
        db.save_state(&second).await.unwrap();

        let loaded = db.load_state(url, Path::new(dest)).await.unwrap().unwrap();
        assert_eq!(
            loaded.tasks.len(),
            1,
            "a later save must fully replace the stored task list"
        );
        assert_eq!(loaded.tasks[0], Task::new(10 * 1024 * 1024, 10 * 1024 * 1024));
    }

    #[tokio::test]
    async fn load_returns_none_without_remaining_tasks() {
        let (db, _dir) = test_db().await;
        let url = "http://example.com/a.bin";
        let dest = "/tmp/a.bin";
        insert(&db, url, dest).await;

        assert!(
            db.load_state(url, Path::new(dest)).await.unwrap().is_none(),
            "a row with no tasks is not a resumable record"
        );
    }

    #[tokio::test]
    async fn load_keys_on_both_url_and_dest_path() {
        let (db, _dir) = test_db().await;
        let url = "http://example.com/a.bin";
        let dest = "/tmp/a.bin";
        let id = insert(&db, url, dest).await;
        db.save_state(&state_for(id, url, dest)).await.unwrap();

        assert!(
            db.load_state(url, Path::new("/tmp/other.bin"))
                .await
                .unwrap()
                .is_none(),
            "same url at a different destination is a different download"
        );
        assert!(
            db.load_state("http://example.com/b.bin", Path::new(dest))
                .await
                .unwrap()
                .is_none(),
            "different url at the same destination is a different download"
        );
    }

    #[tokio::test]
    async fn delete_state_clears_tasks_and_bitmap_but_keeps_the_row() {
        let (db, _dir) = test_db().await;
        let url = "http://example.com/a.bin";
        let dest = "/tmp/a.bin";
        let id = insert(&db, url, dest).await;
        db.save_state(&state_for(id, url, dest)).await.unwrap();

        db.delete_state(id).await.unwrap();

        assert!(db.load_state(url, Path::new(dest)).await.unwrap().is_none());
        let row = db.get_download(id).await.unwrap().unwrap();
        assert!(row.chunk_bitmap.is_none(), "bitmap snapshot must be cleared");
        assert_eq!(row.chunk_size, 0);
    }

    #[tokio::test]
    async fn save_state_for_unknown_download_errors() {
        let (db, _dir) = test_db().await;
        let state = state_for(DownloadId(99), "http://x/", "/tmp/x");
        assert!(db.save_state(&state).await.is_err());
    }
}
