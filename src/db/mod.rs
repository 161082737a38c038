//! Database layer for http-dl
//!
//! Handles SQLite persistence for downloads, resume state, and history.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations
//! - [`downloads`] — Download queue CRUD
//! - [`resume`] — Pause-record save/load/delete for cross-restart resume
//! - [`history`] — Completed/failed download records
//!
//! One store per process, selected at init: construct a [`Database`] once and
//! share it via `Arc`. Tests redirect persistence by constructing against a
//! temporary path.

use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::PathBuf;

mod downloads;
mod history;
mod migrations;
mod resume;

/// New download to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewDownload {
    /// Source URL
    pub url: String,
    /// Destination path (directory until the probe resolves the filename)
    pub dest_path: PathBuf,
    /// Requested filename, empty until resolved
    pub filename: String,
    /// Mirror candidate URLs
    pub mirrors: Vec<String>,
}

/// Download record from database
#[derive(Debug, Clone, FromRow)]
pub struct DownloadRow {
    /// Unique database ID
    pub id: i64,
    /// Source URL
    pub url: String,
    /// SHA-256 of the URL, paired with dest_path to key resume records
    pub url_hash: String,
    /// Destination path
    pub dest_path: String,
    /// Output filename (empty until the probe resolves it)
    pub filename: String,
    /// Current status (see [`crate::types::Status`])
    pub status: i32,
    /// Total size in bytes
    pub total_size: i64,
    /// Bytes downloaded and accounted
    pub downloaded: i64,
    /// Cumulative elapsed time across sessions, in nanoseconds
    pub elapsed_ns: i64,
    /// Mirror candidate list as a JSON array
    pub mirrors: String,
    /// Chunk bitmap snapshot (present only while paused)
    pub chunk_bitmap: Option<Vec<u8>>,
    /// Chunk size used to interpret the bitmap
    pub chunk_size: i64,
    /// Error message if the download failed
    pub error_message: Option<String>,
    /// Unix timestamp when the download was added
    pub created_at: i64,
    /// Unix timestamp when downloading first started
    pub started_at: Option<i64>,
    /// Unix timestamp of the last pause
    pub paused_at: Option<i64>,
    /// Unix timestamp when the download reached a terminal state
    pub completed_at: Option<i64>,
    /// Total wall time spent downloading, in milliseconds
    pub time_taken_ms: Option<i64>,
}

impl DownloadRow {
    /// Decode the stored mirror list
    pub fn mirror_list(&self) -> Vec<String> {
        serde_json::from_str(&self.mirrors).unwrap_or_default()
    }
}

/// Remaining-task record from database
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    /// Download this range belongs to
    pub download_id: i64,
    /// Range start offset in bytes
    pub start_offset: i64,
    /// Range length in bytes
    pub byte_length: i64,
}

/// SQLite-backed store for resume records and history.
///
/// Cheap to clone via the inner pool; typically shared as `Arc<Database>`.
#[derive(Debug, Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}
