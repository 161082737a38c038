//! Shared test helpers for creating HttpDownloader instances in tests.

use crate::config::Config;
use crate::db::Database;
use crate::pool::{HttpDownloader, QueueState};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tempfile::tempdir;

/// Helper to create a test HttpDownloader backed by a temp directory.
///
/// Constructed field-by-field so the background queue processor and
/// progress reporter are NOT running: tests drive state transitions
/// explicitly without racing the admission loop. Returns the downloader and
/// the tempdir (which must be kept alive).
pub(crate) async fn create_test_downloader() -> (HttpDownloader, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();

    let mut config = Config::default();
    config.persistence.database_path = temp_dir.path().join("test.db");
    config.download.download_dir = temp_dir.path().join("downloads");
    config.download.max_concurrent_downloads = 3;
    // Keep failure paths fast in tests
    config.runtime.max_task_retries = 1;
    config.runtime.probe_timeout = std::time::Duration::from_secs(2);

    std::fs::create_dir_all(&config.download.download_dir).unwrap();

    let db = Database::new(&config.persistence.database_path)
        .await
        .unwrap();

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

    let downloader = HttpDownloader {
        db: Arc::new(db),
        event_tx,
        config: Arc::new(config),
        queue_state,
        shutdown: tokio_util::sync::CancellationToken::new(),
    };

    (downloader, temp_dir)
}
