//! Error types for http-dl
//!
//! This module provides the error taxonomy for the engine:
//! - Domain-specific error types (Probe, Download, Database)
//! - Classification into transient vs. permanent failures (see [`crate::retry`])
//! - A `Cancelled` variant that propagates delete-cancellation as-is
//!
//! Pause is deliberately *not* an error; it is the
//! [`DownloadOutcome::Paused`](crate::types::DownloadOutcome) result variant.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for http-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for http-dl
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "min_chunk_size")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Probe failed — the server could not be interrogated for size/range support
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Download-related error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Network error from the HTTP client
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// I/O error (write/seek/rename/preallocate failures are fatal)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Download not found
    #[error("download not found: {0}")]
    NotFound(String),

    /// Another download is already active against the same url + destination
    #[error("conflict: {0}")]
    Conflict(String),

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// The download was cancelled (delete path; no resume record written)
    #[error("download cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Probe errors — why the initial HEAD/ranged-GET interrogation failed
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Network-level failure reaching the server
    #[error("probe of {url} failed: {reason}")]
    Network {
        /// URL that was probed
        url: String,
        /// Underlying failure description
        reason: String,
    },

    /// Server answered with a non-success status
    #[error("probe of {url} returned HTTP {status}")]
    HttpStatus {
        /// URL that was probed
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// Response could not be interpreted (missing/garbled size headers)
    #[error("probe of {url} unparseable: {detail}")]
    Parse {
        /// URL that was probed
        url: String,
        /// What was wrong with the response
        detail: String,
    },

    /// Mirror probe timed out
    #[error("probe of {url} timed out after {timeout_secs}s")]
    Timeout {
        /// URL that was probed
        url: String,
        /// Configured probe timeout
        timeout_secs: u64,
    },
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Server replied with a status that is fatal for this source (401/403,
    /// 4xx other than 408/429)
    #[error("fatal HTTP status {status} from {url}")]
    FatalStatus {
        /// Source URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// Requested range was not satisfiable (416)
    #[error("range {offset}-{end} not satisfiable on {url}")]
    RangeNotSatisfiable {
        /// Source URL
        url: String,
        /// Requested range start
        offset: u64,
        /// Requested range end (inclusive)
        end: u64,
    },

    /// Server ignored the Range header and replied 200 with the whole body.
    /// The coordinator restarts the transfer on a single connection.
    #[error("server {url} ignored the range request (200 OK)")]
    RangeIgnored {
        /// Source URL
        url: String,
    },

    /// A task exhausted its retry budget
    #[error("range at offset {offset} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        /// Offset of the failing range
        offset: u64,
        /// Attempts performed
        attempts: u32,
        /// Last failure description
        reason: String,
    },

    /// Every source (primary and all mirrors) has been marked failed
    #[error("all download sources exhausted for {url}")]
    AllSourcesFailed {
        /// Primary URL
        url: String,
    },

    /// The server sent fewer bytes than the range requested
    #[error("short read at offset {offset}: expected {expected} bytes, got {got}")]
    ShortRead {
        /// Offset of the range
        offset: u64,
        /// Bytes requested
        expected: u64,
        /// Bytes received
        got: u64,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} download {id} in state {current_state}")]
    InvalidState {
        /// The download ID that is in an invalid state for the operation
        id: i64,
        /// The operation that was attempted (e.g., "pause", "resume")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// The working file vanished or was replaced underneath the engine
    #[error("working file missing or clobbered: {path}")]
    WorkingFileMissing {
        /// Path of the working file
        path: PathBuf,
    },
}

impl Error {
    /// Whether this error means the whole download must fail immediately
    /// (as opposed to a per-task retry or a per-mirror degradation).
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Download(DownloadError::FatalStatus { .. })
            | Error::Download(DownloadError::RangeNotSatisfiable { .. })
            | Error::Download(DownloadError::RetriesExhausted { .. })
            | Error::Download(DownloadError::AllSourcesFailed { .. })
            | Error::Download(DownloadError::WorkingFileMissing { .. })
            | Error::Io(_) => true,
            Error::Cancelled => false,
            _ => false,
        }
    }
}

/// Classify an HTTP status for the worker retry loop.
///
/// 5xx, 408 and 429 are transient; 416 is a range failure; other 4xx are
/// fatal for the source that produced them.
pub(crate) fn status_is_retryable(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}
