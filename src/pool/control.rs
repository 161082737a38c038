//! Download lifecycle control — pause, resume, cancel, bulk operations.

use crate::error::{DatabaseError, DownloadError, Error, Result};
use crate::types::{DownloadId, Event, Status};
use crate::utils;

use super::{HttpDownloader, QueuedDownload};

impl HttpDownloader {
    /// Pause a download
    ///
    /// A queued download is taken off the admission queue; an active one has
    /// its engine run cancelled through the pause flag, which persists the
    /// exact remaining work for a later [`resume`](Self::resume). Pausing an
    /// already-paused download is a no-op.
    pub async fn pause(&self, id: DownloadId) -> Result<()> {
        let download = self.db.get_download(id).await?.ok_or_else(|| {
            Error::Database(DatabaseError::NotFound(format!(
                "Download {} not found",
                id
            )))
        })?;

        match Status::from_i32(download.status) {
            Status::Paused => return Ok(()),
            Status::Complete | Status::Failed => {
                return Err(Error::Download(DownloadError::InvalidState {
                    id: id.into(),
                    operation: "pause".to_string(),
                    current_state: format!("{:?}", Status::from_i32(download.status)),
                }));
            }
            Status::Queued | Status::Downloading => {}
        }

        // Active: fire the pause flag; the engine snapshots and persists,
        // and the queue processor records status + event on exit
        let was_active = {
            let active = self.queue_state.active_downloads.lock().await;
            if let Some(handle) = active.get(&id) {
                handle.state.pause();
                true
            } else {
                false
            }
        };

        if !was_active {
            // Still queued: just mark it paused
            self.remove_from_queue(id).await;
            self.db.update_status(id, Status::Paused.to_i32()).await?;
            self.emit_event(Event::Paused {
                id,
                filename: download.filename,
            });
        }

        Ok(())
    }

    /// Resume a paused download
    ///
    /// Re-queues the download with resume semantics: the engine adopts the
    /// persisted task list and bitmap and continues where it left off.
    /// Resuming an already-active download is a no-op.
    pub async fn resume(&self, id: DownloadId) -> Result<()> {
        let download = self.db.get_download(id).await?.ok_or_else(|| {
            Error::Database(DatabaseError::NotFound(format!(
                "Download {} not found",
                id
            )))
        })?;

        match Status::from_i32(download.status) {
            Status::Paused => {}
            Status::Queued | Status::Downloading => return Ok(()),
            Status::Complete | Status::Failed => {
                return Err(Error::Download(DownloadError::InvalidState {
                    id: id.into(),
                    operation: "resume".to_string(),
                    current_state: format!("{:?}", Status::from_i32(download.status)),
                }));
            }
        }

        self.db.update_status(id, Status::Queued.to_i32()).await?;
        self.queue_state
            .queue
            .lock()
            .await
            .push_back(QueuedDownload {
                id,
                is_resume: true,
            });

        tracing::info!(download_id = id.0, "Download resumed");
        self.emit_event(Event::Resumed {
            id,
            filename: download.filename,
        });

        Ok(())
    }

    /// Cancel a download and delete everything it produced
    ///
    /// Stops the engine run if active, removes the working file, the resume
    /// record, and the database row. No resume record survives a cancel.
    pub async fn cancel(&self, id: DownloadId) -> Result<()> {
        let download = self.db.get_download(id).await?.ok_or_else(|| {
            Error::Database(DatabaseError::NotFound(format!(
                "Download {} not found",
                id
            )))
        })?;

        // Stop the engine run without the pause flag, so it exits with
        // Cancelled and writes no resume record
        {
            let mut active = self.queue_state.active_downloads.lock().await;
            if let Some(handle) = active.remove(&id) {
                handle.cancel.cancel();
            }
        }

        self.remove_from_queue(id).await;
        self.queue_state.extras.lock().await.remove(&id);

        // Remove the working file; the final file is left alone
        let working = utils::working_path(std::path::Path::new(&download.dest_path));
        if working.exists()
            && let Err(e) = tokio::fs::remove_file(&working).await
        {
            tracing::warn!(
                download_id = id.0,
                path = %working.display(),
                error = %e,
                "Failed to delete working file"
            );
            // Continue anyway - database deletion is more important
        }

        // Cascades to the remaining-task rows
        self.db.delete_download(id).await?;

        tracing::info!(download_id = id.0, "Download removed");
        self.emit_event(Event::Removed {
            id,
            filename: download.filename,
        });

        Ok(())
    }

    /// Pause every queued or active download
    pub async fn pause_all(&self) -> Result<()> {
        let downloads = self.db.list_downloads().await?;

        let mut paused = 0;
        for download in downloads {
            match Status::from_i32(download.status) {
                Status::Queued | Status::Downloading => {
                    if let Err(e) = self.pause(DownloadId(download.id)).await {
                        tracing::warn!(
                            download_id = download.id,
                            error = %e,
                            "Failed to pause download during pause_all"
                        );
                    } else {
                        paused += 1;
                    }
                }
                Status::Paused | Status::Complete | Status::Failed => {}
            }
        }

        tracing::info!(paused, "Paused all active downloads");
        Ok(())
    }

    /// Resume every paused download
    pub async fn resume_all(&self) -> Result<()> {
        let paused_downloads = self
            .db
            .list_downloads_by_status(Status::Paused.to_i32())
            .await?;

        let mut resumed = 0;
        for download in paused_downloads {
            if let Err(e) = self.resume(DownloadId(download.id)).await {
                tracing::warn!(
                    download_id = download.id,
                    error = %e,
                    "Failed to resume download during resume_all"
                );
            } else {
                resumed += 1;
            }
        }

        tracing::info!(resumed, "Resumed all paused downloads");
        Ok(())
    }

    /// Drop a download from the admission queue, returning whether it was there
    pub(crate) async fn remove_from_queue(&self, id: DownloadId) -> bool {
        let mut queue = self.queue_state.queue.lock().await;
        let before = queue.len();
        queue.retain(|item| item.id != id);
        queue.len() < before
    }
}
