//! The worker pool: admission control and lifecycle over many downloads.
//!
//! The `HttpDownloader` struct and its methods are organized by domain:
//! - [`control`] - download lifecycle control (pause/resume/cancel)
//! - [`queue_processor`] - admission and download task spawning
//! - [`progress_reporter`] - batched progress event emission
//!
//! Admission is a FIFO queue drained under a semaphore sized to
//! `max_concurrent_downloads`; each admitted download runs the engine's
//! [`download()`](crate::engine::download) with its own cancellation token.

mod control;
mod progress_reporter;
mod queue_processor;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::{Database, NewDownload};
use crate::engine::ProgressState;
use crate::error::{Error, Result};
use crate::types::{AddOptions, DownloadId, DownloadInfo, Event, MirrorStatus, Status};

/// A download waiting for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuedDownload {
    pub(crate) id: DownloadId,
    /// Whether the engine should adopt a persisted resume record
    pub(crate) is_resume: bool,
}

/// Live handle to an admitted download
#[derive(Clone)]
pub(crate) struct ActiveDownload {
    /// Cancels the engine run (delete); pause goes through the state
    pub(crate) cancel: CancellationToken,
    /// Shared progress state, also the pause surface
    pub(crate) state: Arc<ProgressState>,
}

/// Session-only per-download inputs that are never persisted
#[derive(Debug, Clone, Default)]
pub(crate) struct AddExtras {
    pub(crate) headers: HashMap<String, String>,
    pub(crate) filename: Option<String>,
    pub(crate) force_single: bool,
}

/// Queue and download state management
#[derive(Clone)]
pub(crate) struct QueueState {
    /// FIFO of downloads waiting for a slot
    pub(crate) queue: Arc<tokio::sync::Mutex<VecDeque<QueuedDownload>>>,
    /// Semaphore bounding concurrent downloads (max_concurrent_downloads)
    pub(crate) concurrent_limit: Arc<tokio::sync::Semaphore>,
    /// Live handles for admitted downloads
    pub(crate) active_downloads: Arc<tokio::sync::Mutex<HashMap<DownloadId, ActiveDownload>>>,
    /// Cleared during shutdown so no new downloads are accepted
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Session-only extras (headers, overrides) keyed by download
    pub(crate) extras: Arc<tokio::sync::Mutex<HashMap<DownloadId, AddExtras>>>,
}

/// Main downloader instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct HttpDownloader {
    /// Database instance for persistence.
    /// Public for integration tests to query download status
    pub db: Arc<Database>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Queue and download state management
    pub(crate) queue_state: QueueState,
    /// Stops the background tasks on shutdown
    pub(crate) shutdown: CancellationToken,
}

impl HttpDownloader {
    /// Create a new HttpDownloader instance
    ///
    /// This initializes all core components:
    /// - Validates the configuration
    /// - Opens/creates the SQLite database and runs migrations
    /// - Restores interrupted downloads from the previous session
    /// - Starts the queue processor and the progress reporter
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.download.download_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.download.download_dir.display(),
                        e
                    ),
                ))
            })?;

        let db = Database::new(&config.persistence.database_path).await?;

        // Buffered channel: subscribers that fall behind see Lagged, the
        // engine never blocks on a slow consumer
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);

        let queue_state = QueueState {
            queue: Arc::new(tokio::sync::Mutex::new(VecDeque::new())),
            concurrent_limit: Arc::new(tokio::sync::Semaphore::new(
                config.download.max_concurrent_downloads,
            )),
            active_downloads: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            accepting_new: Arc::new(AtomicBool::new(true)),
            extras: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        };

        let downloader = Self {
            db: Arc::new(db),
            event_tx,
            config: Arc::new(config),
            queue_state,
            shutdown: CancellationToken::new(),
        };

        // Re-queue downloads interrupted by the previous session
        downloader.restore_queue().await?;

        downloader.start_queue_processor();
        downloader.start_progress_reporter();

        Ok(downloader)
    }

    /// Subscribe to download events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all
    /// events independently; one falling more than 1000 events behind
    /// receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Emit an event to all subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped;
    /// downloads proceed whether or not anyone is listening.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Queue a download and return its ID.
    ///
    /// Rejects with [`Error::Conflict`] when another non-terminal download
    /// already targets the same URL and destination — the engine never runs
    /// two downloads against the same working file.
    pub async fn add(&self, url: &str, options: AddOptions) -> Result<DownloadId> {
        if !self.queue_state.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let dest_dir = options
            .dest_dir
            .clone()
            .unwrap_or_else(|| self.config.download.download_dir.clone());

        // Duplicate add of the same url + destination while active
        for row in self.db.find_active_by_url(url).await? {
            if same_destination(Path::new(&row.dest_path), &dest_dir) {
                return Err(Error::Conflict(format!(
                    "download {} already targets {} from this URL",
                    row.id, row.dest_path
                )));
            }
        }

        let filename = options
            .filename
            .clone()
            .map(|name| crate::utils::sanitize_filename(&name))
            .unwrap_or_default();
        let dest_path = if filename.is_empty() {
            dest_dir.clone()
        } else {
            dest_dir.join(&filename)
        };

        let id = self
            .db
            .insert_download(&NewDownload {
                url: url.to_string(),
                dest_path,
                filename: filename.clone(),
                mirrors: options.mirrors.clone(),
            })
            .await?;

        self.queue_state.extras.lock().await.insert(
            id,
            AddExtras {
                headers: options.headers,
                filename: options.filename,
                force_single: options.force_single,
            },
        );

        self.queue_state
            .queue
            .lock()
            .await
            .push_back(QueuedDownload {
                id,
                is_resume: false,
            });

        tracing::info!(download_id = id.0, url, "Download queued");
        self.emit_event(Event::Queued { id, filename });

        Ok(id)
    }

    /// Information about one download
    pub async fn get_status(&self, id: DownloadId) -> Result<DownloadInfo> {
        let row = self
            .db
            .get_download(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Download {} not found", id)))?;
        Ok(self.row_to_info(row).await)
    }

    /// Information about every known download, newest first
    pub async fn list(&self) -> Result<Vec<DownloadInfo>> {
        let rows = self.db.list_downloads().await?;
        let mut infos = Vec::with_capacity(rows.len());
        for row in rows {
            infos.push(self.row_to_info(row).await);
        }
        Ok(infos)
    }

    /// Terminal downloads, most recently finished first
    pub async fn history(&self) -> Result<Vec<DownloadInfo>> {
        let rows = self.db.history().await?;
        let mut infos = Vec::with_capacity(rows.len());
        for row in rows {
            infos.push(self.row_to_info(row).await);
        }
        Ok(infos)
    }

    /// Restore interrupted downloads from the previous session.
    ///
    /// Queued and Downloading rows are re-queued with resume semantics;
    /// explicitly paused rows stay paused until the caller resumes them.
    pub async fn restore_queue(&self) -> Result<usize> {
        let interrupted = self.db.get_incomplete_downloads().await?;
        if interrupted.is_empty() {
            return Ok(0);
        }

        let mut queue = self.queue_state.queue.lock().await;
        let mut restored = 0;
        for row in interrupted {
            let id = DownloadId(row.id);
            if queue.iter().any(|q| q.id == id) {
                continue;
            }
            tracing::info!(download_id = row.id, "Restoring interrupted download");
            self.db.update_status(id, Status::Queued.to_i32()).await?;
            queue.push_back(QueuedDownload {
                id,
                is_resume: true,
            });
            restored += 1;
        }

        tracing::info!(restored, "Queue restoration complete");
        Ok(restored)
    }

    /// Gracefully stop: refuse new work, pause active downloads so their
    /// resume state persists, and stop the background tasks.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue_state.accepting_new.store(false, Ordering::SeqCst);

        // Pause everything that is running; the engine persists resume state
        let active: Vec<_> = {
            let guard = self.queue_state.active_downloads.lock().await;
            guard.values().cloned().collect()
        };
        for handle in &active {
            handle.state.pause();
        }

        // Wait for the engine runs to wind down
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            if self.queue_state.active_downloads.lock().await.is_empty() {
                break;
            }
            if std::time::Instant::now() >= deadline {
                tracing::warn!("Shutdown timed out waiting for active downloads");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        self.shutdown.cancel();
        self.db.close().await;
        Ok(())
    }

    async fn row_to_info(&self, row: crate::db::DownloadRow) -> DownloadInfo {
        let id = DownloadId(row.id);
        let active = self.queue_state.active_downloads.lock().await.get(&id).cloned();

        let (downloaded, speed_bps, mirrors) = match &active {
            Some(handle) => (
                handle.state.downloaded(),
                handle.state.speed_bps(),
                handle.state.mirrors(),
            ),
            None => (
                row.downloaded as u64,
                0,
                row.mirror_list()
                    .into_iter()
                    .map(|url| MirrorStatus {
                        url,
                        active: false,
                        error: false,
                    })
                    .collect(),
            ),
        };

        DownloadInfo {
            id,
            url: row.url,
            filename: row.filename,
            dest_path: PathBuf::from(row.dest_path),
            status: Status::from_i32(row.status),
            total: row.total_size as u64,
            downloaded,
            speed_bps,
            created_at: chrono::DateTime::from_timestamp(row.created_at, 0)
                .unwrap_or_else(chrono::Utc::now),
            mirrors,
            error: row.error_message,
        }
    }
}

/// Whether an existing download's destination clashes with a new add into
/// `dest_dir` (the stored path may be the directory or an already-resolved
/// file inside it).
fn same_destination(existing: &Path, dest_dir: &Path) -> bool {
    existing == dest_dir || existing.parent() == Some(dest_dir)
}
