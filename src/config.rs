//! Configuration types for http-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Write alignment for chunk boundaries (4 KiB)
pub const ALIGN_SIZE: u64 = 4096;

/// Preferred protocol for the transport set
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolPreference {
    /// Prefer the newest supported protocol (H3 > H2 > H1) with full fallback chain
    #[default]
    Auto,
    /// HTTP/1.1 exclusively
    H1,
    /// HTTP/2 preferred, HTTP/1.1 fallback
    H2,
    /// HTTP/3 preferred, HTTP/1.1 fallback
    H3,
}

/// Per-download engine tuning.
///
/// Every knob has a sensible default; construct with `RuntimeOptions::default()`
/// and override what you need.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Maximum simultaneous connections per host (default: 16)
    #[serde(default = "default_max_connections")]
    pub max_connections_per_host: usize,

    /// Hard override for the worker count. Wins over the size heuristic but is
    /// still clamped by `max_connections_per_host` and the minimum chunk size.
    #[serde(default)]
    pub connection_count_override: Option<usize>,

    /// Minimum task chunk size in bytes (default: 2 MiB)
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,

    /// Per-worker streaming buffer size in bytes (default: 64 KiB)
    #[serde(default = "default_worker_buffer_size")]
    pub worker_buffer_size: usize,

    /// Protocol preference (default: auto)
    #[serde(default)]
    pub protocol_preference: ProtocolPreference,

    /// Sequential mode: fixed `min_chunk_size` chunks to preserve ordering (default: false)
    #[serde(default)]
    pub sequential_download: bool,

    /// Skip the concurrent engine entirely (default: false)
    #[serde(default)]
    pub force_single: bool,

    /// Retry budget per task for transient failures (default: 5)
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,

    /// A worker is slow when its decayed speed falls below this fraction of
    /// the fleet median (default: 0.25)
    #[serde(default = "default_slow_worker_threshold")]
    pub slow_worker_threshold: f64,

    /// How long a worker must stay slow before it becomes hedge-eligible
    /// (default: 10 s)
    #[serde(default = "default_slow_worker_grace", with = "duration_ms")]
    pub slow_worker_grace: Duration,

    /// A worker is stalled when it has produced no bytes for this long; its
    /// in-flight request is cancelled and the range re-queued (default: 30 s)
    #[serde(default = "default_stall_timeout", with = "duration_ms")]
    pub stall_timeout: Duration,

    /// Interval between health monitor sweeps (default: 2 s)
    #[serde(default = "default_health_check_interval", with = "duration_ms")]
    pub health_check_interval: Duration,

    /// Exponential moving average weight for per-worker speed (default: 0.3)
    #[serde(default = "default_speed_ema_alpha")]
    pub speed_ema_alpha: f64,

    /// Timeout for HEAD/ranged-GET probes, including mirror probing (default: 12 s)
    #[serde(default = "default_probe_timeout", with = "duration_ms")]
    pub probe_timeout: Duration,

    /// Proxy URL. Disables HTTP/3 when set (QUIC over proxies is not modeled).
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// User agent sent on every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_connections_per_host: default_max_connections(),
            connection_count_override: None,
            min_chunk_size: default_min_chunk_size(),
            worker_buffer_size: default_worker_buffer_size(),
            protocol_preference: ProtocolPreference::default(),
            sequential_download: false,
            force_single: false,
            max_task_retries: default_max_task_retries(),
            slow_worker_threshold: default_slow_worker_threshold(),
            slow_worker_grace: default_slow_worker_grace(),
            stall_timeout: default_stall_timeout(),
            health_check_interval: default_health_check_interval(),
            speed_ema_alpha: default_speed_ema_alpha(),
            probe_timeout: default_probe_timeout(),
            proxy_url: None,
            user_agent: default_user_agent(),
        }
    }
}

impl RuntimeOptions {
    /// Validate option ranges, returning a keyed configuration error on the
    /// first violation.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections_per_host == 0 {
            return Err(config_err(
                "max_connections_per_host must be at least 1",
                "max_connections_per_host",
            ));
        }
        if self.min_chunk_size < ALIGN_SIZE {
            return Err(config_err(
                "min_chunk_size must be at least the 4 KiB write alignment",
                "min_chunk_size",
            ));
        }
        if self.worker_buffer_size == 0 {
            return Err(config_err(
                "worker_buffer_size must be non-zero",
                "worker_buffer_size",
            ));
        }
        if !(0.0..1.0).contains(&self.slow_worker_threshold) {
            return Err(config_err(
                "slow_worker_threshold must be in [0, 1)",
                "slow_worker_threshold",
            ));
        }
        if !(0.0..=1.0).contains(&self.speed_ema_alpha) || self.speed_ema_alpha == 0.0 {
            return Err(config_err(
                "speed_ema_alpha must be in (0, 1]",
                "speed_ema_alpha",
            ));
        }
        if self.stall_timeout.is_zero() {
            return Err(config_err(
                "stall_timeout must be non-zero",
                "stall_timeout",
            ));
        }
        Ok(())
    }
}

/// Download pool configuration (directories, admission limit)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadDirConfig {
    /// Directory completed files land in (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum downloads running at once; further adds queue (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,
}

impl Default for DownloadDirConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path for resume records and history (default: "./http-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_ms")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for [`HttpDownloader`](crate::HttpDownloader)
///
/// Fields are organized into logical sub-configs:
/// - [`download`](DownloadDirConfig) — directories, admission limit
/// - [`runtime`](RuntimeOptions) — engine tuning shared by all downloads
/// - [`persistence`](PersistenceConfig) — resume/history database
/// - [`retry`](RetryConfig) — backoff for transient failures
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directories and admission limit
    #[serde(default)]
    pub download: DownloadDirConfig,

    /// Engine tuning shared by all downloads
    #[serde(default)]
    pub runtime: RuntimeOptions,

    /// Resume/history database
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Backoff configuration for transient failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(config_err(
                "max_concurrent_downloads must be at least 1",
                "max_concurrent_downloads",
            ));
        }
        self.runtime.validate()
    }
}

fn config_err(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

fn default_max_connections() -> usize {
    16
}

fn default_min_chunk_size() -> u64 {
    2 * 1024 * 1024
}

fn default_worker_buffer_size() -> usize {
    64 * 1024
}

fn default_max_task_retries() -> u32 {
    5
}

fn default_slow_worker_threshold() -> f64 {
    0.25
}

fn default_slow_worker_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_speed_ema_alpha() -> f64 {
    0.3
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(12)
}

fn default_user_agent() -> String {
    concat!("http-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./http-dl.db")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

/// Serialize `Duration` as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
