//! Queue processor — admits downloads under the concurrency limit and
//! spawns engine runs.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::engine::{self, DownloadRequest, EngineContext, ProgressState};
use crate::error::Error;
use crate::types::{DownloadId, DownloadOutcome, Event, Status};

use super::{ActiveDownload, HttpDownloader};

/// Interval between queue polling attempts when the queue is empty
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl HttpDownloader {
    /// Start the queue processor task.
    ///
    /// The processor continuously:
    /// 1. Takes the next queued download (FIFO)
    /// 2. Acquires a permit from the concurrency limiter
    /// 3. Spawns an engine run for it
    /// 4. Repeats until shutdown
    pub(crate) fn start_queue_processor(&self) -> tokio::task::JoinHandle<()> {
        let downloader = self.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let queued = {
                    let mut queue = downloader.queue_state.queue.lock().await;
                    queue.pop_front()
                };

                let Some(item) = queued else {
                    tokio::select! {
                        _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => continue,
                        _ = shutdown.cancelled() => return,
                    }
                };

                let permit = tokio::select! {
                    permit = downloader
                        .queue_state
                        .concurrent_limit
                        .clone()
                        .acquire_owned() => permit,
                    _ = shutdown.cancelled() => {
                        // Re-queue so the item isn't lost for a later restore
                        downloader.queue_state.queue.lock().await.push_front(item);
                        return;
                    }
                };
                let Ok(permit) = permit else { return };

                let cancel = CancellationToken::new();
                let state = Arc::new(ProgressState::new());

                {
                    let mut active = downloader.queue_state.active_downloads.lock().await;
                    active.insert(
                        item.id,
                        ActiveDownload {
                            cancel: cancel.clone(),
                            state: state.clone(),
                        },
                    );
                }

                let pool = downloader.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    pool.run_download(item.id, item.is_resume, state, cancel).await;
                    pool.queue_state.active_downloads.lock().await.remove(&item.id);
                });
            }
        })
    }

    /// One engine run plus its bookkeeping (status, history, events).
    async fn run_download(
        &self,
        id: DownloadId,
        is_resume: bool,
        state: Arc<ProgressState>,
        cancel: CancellationToken,
    ) {
        let row = match self.db.get_download(id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                tracing::warn!(download_id = id.0, "Download vanished before start");
                return;
            }
            Err(e) => {
                tracing::error!(download_id = id.0, error = %e, "Failed to load download");
                return;
            }
        };

        // A pause/cancel can race the admission pop; honor it before starting
        if Status::from_i32(row.status) != Status::Queued {
            tracing::debug!(
                download_id = id.0,
                status = row.status,
                "Skipping admitted download whose status changed"
            );
            return;
        }

        if let Err(e) = self.db.update_status(id, Status::Downloading.to_i32()).await {
            tracing::error!(download_id = id.0, error = %e, "Failed to update status");
            return;
        }

        let extras = self
            .queue_state
            .extras
            .lock()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default();

        let request = DownloadRequest {
            id,
            url: row.url.clone(),
            mirrors: row.mirror_list(),
            dest_path: std::path::PathBuf::from(&row.dest_path),
            filename: extras
                .filename
                .or_else(|| (!row.filename.is_empty()).then(|| row.filename.clone())),
            headers: extras.headers,
            is_resume,
            force_single: extras.force_single,
        };

        let ctx = EngineContext {
            db: Arc::clone(&self.db),
            state: state.clone(),
            events: self.event_tx.clone(),
            runtime: Arc::new(self.config.runtime.clone()),
            retry: self.config.retry.clone(),
            cancel,
        };

        let outcome = engine::download(request, ctx).await;

        // Refetch for the resolved filename
        let filename = self
            .db
            .get_download(id)
            .await
            .ok()
            .flatten()
            .map(|r| r.filename)
            .unwrap_or_default();

        match outcome {
            Ok(DownloadOutcome::Completed) => {
                let elapsed = state.elapsed();
                let total = state.total_size();
                if let Err(e) = self
                    .db
                    .record_completed(id, total, elapsed.as_millis() as u64)
                    .await
                {
                    tracing::error!(download_id = id.0, error = %e, "Failed to record completion");
                }
                self.queue_state.extras.lock().await.remove(&id);
                tracing::info!(
                    download_id = id.0,
                    filename = %filename,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Download complete"
                );
                self.emit_event(Event::Complete {
                    id,
                    filename,
                    elapsed_ms: elapsed.as_millis() as u64,
                    total,
                });
            }
            Ok(DownloadOutcome::Paused) => {
                if let Err(e) = self.db.update_status(id, Status::Paused.to_i32()).await {
                    tracing::error!(download_id = id.0, error = %e, "Failed to mark paused");
                }
                tracing::info!(download_id = id.0, "Download paused cleanly");
                self.emit_event(Event::Paused { id, filename });
            }
            Err(Error::Cancelled) => {
                // Delete path: cancel() already removed the record and
                // emitted Removed
                tracing::debug!(download_id = id.0, "Download cancelled");
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(db_err) = self.db.record_failed(id, &message).await {
                    tracing::error!(download_id = id.0, error = %db_err, "Failed to record error");
                }
                self.queue_state.extras.lock().await.remove(&id);
                tracing::error!(download_id = id.0, error = %message, "Download failed");
                self.emit_event(Event::Error {
                    id,
                    filename,
                    error: message,
                });
            }
        }
    }
}
