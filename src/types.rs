//! Core types for http-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Unique identifier for a download
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub i64);

impl DownloadId {
    /// Create a new DownloadId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for DownloadId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<DownloadId> for i64 {
    fn from(id: DownloadId) -> Self {
        id.0
    }
}

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DownloadId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for DownloadId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for DownloadId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for DownloadId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Download status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Queued and waiting to start
    Queued,
    /// Currently downloading
    Downloading,
    /// Paused by user (resume state persisted)
    Paused,
    /// Successfully completed and renamed into place
    Complete,
    /// Failed with error
    Failed,
}

impl Status {
    /// Convert integer status code to Status enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => Status::Queued,
            1 => Status::Downloading,
            2 => Status::Paused,
            3 => Status::Complete,
            4 => Status::Failed,
            _ => Status::Failed, // Default to Failed for unknown status
        }
    }

    /// Convert Status enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            Status::Queued => 0,
            Status::Downloading => 1,
            Status::Paused => 2,
            Status::Complete => 3,
            Status::Failed => 4,
        }
    }

    /// Whether this status is terminal (the download will not make further progress)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Complete | Status::Failed)
    }
}

/// A half-open byte range `[offset, offset + length)` of the remote object.
///
/// The initial task set partitions `[0, total_size)` without gaps or overlap.
/// Splits performed by the balancer preserve that partition; hedged
/// duplicates deliberately overlap and are excluded from accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Start offset in bytes
    pub offset: u64,
    /// Length in bytes (always > 0 for a valid task)
    pub length: u64,
}

impl Task {
    /// Create a new task covering `[offset, offset + length)`
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset of the range
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Status of one download source (the primary URL or a mirror).
///
/// Mirrors that failed probing are kept with `error = true` so consumers can
/// show them instead of silently dropping them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorStatus {
    /// Source URL
    pub url: String,
    /// Whether workers may currently select this source
    pub active: bool,
    /// Whether this source has failed (probe failure or repeated errors)
    pub error: bool,
}

/// Persisted pause record — everything needed to continue a download across
/// process restarts.
///
/// Invariant: `downloaded + sum(tasks[i].length) == total_size`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadState {
    /// Source URL
    pub url: String,
    /// Download identifier
    pub id: DownloadId,
    /// Final destination path (the working file is `dest_path` + ".partial")
    pub dest_path: PathBuf,
    /// Total object size in bytes
    pub total_size: u64,
    /// Bytes already written and accounted
    pub downloaded: u64,
    /// Exact remaining byte ranges
    pub tasks: Vec<Task>,
    /// Resolved output filename
    pub filename: String,
    /// Cumulative elapsed time across sessions, in nanoseconds
    pub elapsed_ns: i64,
    /// Mirror candidate list as originally supplied
    pub mirrors: Vec<String>,
    /// Chunk bitmap (one bit per visualization chunk, bit set = chunk fully written)
    pub chunk_bitmap: Vec<u8>,
    /// Chunk size used to interpret the bitmap
    pub chunk_size: u64,
}

impl DownloadState {
    /// Sum of the remaining task lengths
    pub fn remaining_bytes(&self) -> u64 {
        self.tasks.iter().map(|t| t.length).sum()
    }
}

/// Outcome of a single `download()` run.
///
/// Pause is a distinguished result, not an error: callers must be able to
/// tell "paused cleanly, resume state persisted" apart from "failed
/// mid-transfer".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The file was fully downloaded, fsynced, and renamed into place
    Completed,
    /// The download was paused and its resume record persisted
    Paused,
}

/// A single progress observation for one download
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Download ID
    pub id: DownloadId,
    /// Bytes downloaded and accounted so far
    pub downloaded: u64,
    /// Total size in bytes
    pub total: u64,
    /// Current session speed in bytes per second
    pub speed_bps: u64,
    /// Elapsed time including previous sessions, in milliseconds
    pub elapsed_ms: u64,
}

/// Event emitted on the progress channel during the download lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Download added to the queue
    Queued {
        /// Download ID
        id: DownloadId,
        /// Resolved or requested filename
        filename: String,
    },

    /// Download started (probe complete, workers starting)
    Started {
        /// Download ID
        id: DownloadId,
        /// Source URL
        url: String,
        /// Resolved output filename
        filename: String,
        /// Total size in bytes
        total: u64,
        /// Final destination path
        dest_path: PathBuf,
    },

    /// Progress update for a single download
    Progress(ProgressUpdate),

    /// Batched progress updates for all active downloads
    BatchProgress {
        /// One update per active download
        updates: Vec<ProgressUpdate>,
    },

    /// Download paused, resume state persisted
    Paused {
        /// Download ID
        id: DownloadId,
        /// Output filename
        filename: String,
    },

    /// Paused download re-queued
    Resumed {
        /// Download ID
        id: DownloadId,
        /// Output filename
        filename: String,
    },

    /// Download removed (cancelled and cleaned up)
    Removed {
        /// Download ID
        id: DownloadId,
        /// Output filename
        filename: String,
    },

    /// Download completed and renamed into place
    Complete {
        /// Download ID
        id: DownloadId,
        /// Output filename
        filename: String,
        /// Total elapsed time across sessions, in milliseconds
        elapsed_ms: u64,
        /// Total size in bytes
        total: u64,
    },

    /// Download failed
    Error {
        /// Download ID
        id: DownloadId,
        /// Output filename
        filename: String,
        /// Error message
        error: String,
    },
}

/// Options for adding a download to the pool
#[derive(Clone, Debug, Default)]
pub struct AddOptions {
    /// Mirror URLs to probe and use alongside the primary
    pub mirrors: Vec<String>,

    /// Explicit output filename (extension borrowed from the probe when missing)
    pub filename: Option<String>,

    /// Override the configured download directory for this download
    pub dest_dir: Option<PathBuf>,

    /// Headers forwarded verbatim on every request (cookies, auth, ...)
    pub headers: HashMap<String, String>,

    /// Skip the concurrent engine and download on a single connection
    pub force_single: bool,
}

/// Information about a download in the pool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadInfo {
    /// Unique download identifier
    pub id: DownloadId,

    /// Source URL
    pub url: String,

    /// Output filename (empty until the probe resolves it)
    pub filename: String,

    /// Destination path
    pub dest_path: PathBuf,

    /// Current status
    pub status: Status,

    /// Total size in bytes (0 until probed)
    pub total: u64,

    /// Downloaded bytes so far
    pub downloaded: u64,

    /// Current speed in bytes per second (0 when not active)
    pub speed_bps: u64,

    /// When the download was added
    pub created_at: DateTime<Utc>,

    /// Per-source status (primary first)
    pub mirrors: Vec<MirrorStatus>,

    /// Error message for failed downloads
    pub error: Option<String>,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // --- Status integer encoding ---

    #[test]
    fn status_round_trips_through_i32_for_all_variants() {
        let cases = [
            (Status::Queued, 0),
            (Status::Downloading, 1),
            (Status::Paused, 2),
            (Status::Complete, 3),
            (Status::Failed, 4),
        ];

        for (variant, expected_int) in cases {
            assert_eq!(
                variant.to_i32(),
                expected_int,
                "{variant:?} should encode to {expected_int}"
            );
            assert_eq!(
                Status::from_i32(expected_int),
                variant,
                "{expected_int} should decode to {variant:?}"
            );
        }
    }

    #[test]
    fn status_from_unknown_integer_defaults_to_failed() {
        assert_eq!(
            Status::from_i32(99),
            Status::Failed,
            "unknown status 99 must fall back to Failed so corrupted DB rows surface visibly"
        );
        assert_eq!(
            Status::from_i32(-1),
            Status::Failed,
            "negative status must fall back to Failed — not silently become Queued"
        );
    }

    #[test]
    fn terminal_statuses_are_exactly_complete_and_failed() {
        assert!(Status::Complete.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Queued.is_terminal());
        assert!(!Status::Downloading.is_terminal());
        assert!(
            !Status::Paused.is_terminal(),
            "paused downloads can still make progress after resume"
        );
    }

    // --- DownloadId conversions ---

    #[test]
    fn download_id_from_i64_and_back() {
        let id = DownloadId::from(42_i64);
        let raw: i64 = id.into();
        assert_eq!(
            raw, 42,
            "round-trip through From<i64>/Into<i64> must preserve value"
        );
    }

    #[test]
    fn download_id_from_str_parses_valid_integer() {
        let id = DownloadId::from_str("123").unwrap();
        assert_eq!(id.get(), 123);
    }

    #[test]
    fn download_id_from_str_rejects_non_numeric() {
        assert!(
            DownloadId::from_str("abc").is_err(),
            "non-numeric string must fail to parse"
        );
        assert!(
            DownloadId::from_str("").is_err(),
            "empty string must not parse to a DownloadId"
        );
    }

    #[test]
    fn download_id_display_matches_inner_value() {
        let id = DownloadId::new(999);
        assert_eq!(
            id.to_string(),
            "999",
            "Display should produce the raw i64 value"
        );
    }

    // --- Task ranges ---

    #[test]
    fn task_end_is_exclusive_upper_bound() {
        let task = Task::new(4096, 1024);
        assert_eq!(task.end(), 5120);
    }

    #[test]
    fn download_state_remaining_bytes_sums_task_lengths() {
        let state = DownloadState {
            url: "http://example.com/a.bin".to_string(),
            id: DownloadId::new(1),
            dest_path: PathBuf::from("/tmp/a.bin"),
            total_size: 100,
            downloaded: 40,
            tasks: vec![Task::new(40, 10), Task::new(50, 50)],
            filename: "a.bin".to_string(),
            elapsed_ns: 0,
            mirrors: vec![],
            chunk_bitmap: vec![],
            chunk_size: 0,
        };
        assert_eq!(state.remaining_bytes(), 60);
        assert_eq!(
            state.downloaded + state.remaining_bytes(),
            state.total_size,
            "pause record invariant: downloaded + remaining == total"
        );
    }

    #[test]
    fn event_serializes_with_snake_case_type_tag() {
        let event = Event::Paused {
            id: DownloadId::new(7),
            filename: "foo.bin".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(
            json.contains(r#""type":"paused""#),
            "expected snake_case type tag, got: {json}"
        );
    }
}
