//! Shared progress state: counters, chunk bitmap, pause flag, mirrors.
//!
//! One `Arc<ProgressState>` is shared by the coordinator, the workers, the
//! health monitor, and the external consumer. Immutable after construction
//! except through atomics and the bitmap/session mutexes, so no component
//! holds a back-pointer to any other.
//!
//! Accounting is gated on visualization-chunk completion: `downloaded` grows
//! only when a chunk's last byte is persisted and its bit flips, which makes
//! double-counting impossible even when hedged duplicates or stall-requeues
//! rewrite bytes. Chunks partially present after a resume carry a credit so
//! completing them adds only the uncredited remainder.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::types::{MirrorStatus, Task};

#[derive(Debug)]
struct ChunkBitmap {
    bits: Vec<u8>,
    chunk_size: u64,
    file_size: u64,
    /// Bytes written per chunk during this session
    written: Vec<u64>,
    /// Bytes already accounted per chunk by a previous session
    credit: Vec<u64>,
}

impl ChunkBitmap {
    fn new(file_size: u64, chunk_size: u64) -> Self {
        let chunks = if chunk_size == 0 {
            0
        } else {
            file_size.div_ceil(chunk_size) as usize
        };
        Self {
            bits: vec![0u8; chunks.div_ceil(8)],
            chunk_size,
            file_size,
            written: vec![0u64; chunks],
            credit: vec![0u64; chunks],
        }
    }

    fn chunk_count(&self) -> usize {
        self.written.len()
    }

    fn chunk_len(&self, idx: usize) -> u64 {
        let start = idx as u64 * self.chunk_size;
        self.chunk_size.min(self.file_size - start)
    }

    fn bit(&self, idx: usize) -> bool {
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn set_bit(&mut self, idx: usize) {
        self.bits[idx / 8] |= 1 << (idx % 8);
    }
}

#[derive(Debug)]
struct SessionClock {
    session_start: Instant,
    /// `downloaded` at session start; live speed ignores pre-resume bytes
    session_base: u64,
    saved_elapsed: Duration,
}

/// Thread-safe progress state shared across a download.
#[derive(Debug)]
pub struct ProgressState {
    total_size: AtomicU64,
    downloaded: AtomicU64,
    /// Bytes proven present (sum of fully-set chunks after restore)
    verified: AtomicU64,
    paused: AtomicBool,
    bitmap: Mutex<Option<ChunkBitmap>>,
    session: Mutex<SessionClock>,
    cancel: Mutex<Option<CancellationToken>>,
    mirrors: Mutex<Vec<MirrorStatus>>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressState {
    /// Create an empty progress state
    pub fn new() -> Self {
        Self {
            total_size: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            verified: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            bitmap: Mutex::new(None),
            session: Mutex::new(SessionClock {
                session_start: Instant::now(),
                session_base: 0,
                saved_elapsed: Duration::ZERO,
            }),
            cancel: Mutex::new(None),
            mirrors: Mutex::new(Vec::new()),
        }
    }

    /// Set the total object size
    pub fn set_total_size(&self, total: u64) {
        self.total_size.store(total, Ordering::SeqCst);
    }

    /// Total object size in bytes
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    /// Bytes downloaded and accounted
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Bytes proven present after the last restore
    pub fn verified(&self) -> u64 {
        self.verified.load(Ordering::SeqCst)
    }

    /// Overwrite the downloaded counter (resume reconciliation, pause finalize)
    pub fn store_downloaded(&self, value: u64) {
        self.downloaded.store(value, Ordering::SeqCst);
    }

    /// Allocate a fresh bitmap of `ceil(file_size / chunk_size)` bits
    pub fn init_bitmap(&self, file_size: u64, chunk_size: u64) {
        let mut bitmap = self.bitmap.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *bitmap = Some(ChunkBitmap::new(file_size, chunk_size));
    }

    /// Drop the bitmap entirely; byte accounting becomes direct.
    ///
    /// Used when a transfer restarts in single-connection mode after a
    /// concurrent attempt left chunk state behind.
    pub fn clear_bitmap(&self) {
        let mut bitmap = self.bitmap.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *bitmap = None;
    }

    /// Account for bytes persisted at `[offset, offset + len)`.
    ///
    /// Chunks whose last byte just landed have their bit set and their
    /// uncredited length added to `downloaded`. Chunks whose bit is already
    /// set are skipped, which is what makes duplicate writes free.
    pub fn mark_bytes(&self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut guard = self.bitmap.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(bitmap) = guard.as_mut() else {
            // No bitmap (sequential fallback): count bytes directly
            drop(guard);
            self.downloaded.fetch_add(len, Ordering::SeqCst);
            return;
        };

        let end = (offset + len).min(bitmap.file_size);
        if end <= offset || bitmap.chunk_count() == 0 {
            return;
        }
        let first = (offset / bitmap.chunk_size) as usize;
        let last = ((end - 1) / bitmap.chunk_size) as usize;

        let mut newly_counted = 0u64;
        for idx in first..=last.min(bitmap.chunk_count() - 1) {
            if bitmap.bit(idx) {
                continue;
            }
            let chunk_start = idx as u64 * bitmap.chunk_size;
            let chunk_end = chunk_start + bitmap.chunk_len(idx);
            let overlap = end.min(chunk_end).saturating_sub(offset.max(chunk_start));
            bitmap.written[idx] += overlap;

            if bitmap.written[idx] + bitmap.credit[idx] >= bitmap.chunk_len(idx) {
                bitmap.set_bit(idx);
                newly_counted += bitmap.chunk_len(idx) - bitmap.credit[idx];
            }
        }
        drop(guard);

        if newly_counted > 0 {
            self.downloaded.fetch_add(newly_counted, Ordering::SeqCst);
        }
    }

    /// Rehydrate the bitmap from a persisted snapshot.
    ///
    /// Sets `verified` to the summed length of fully-set chunks; those chunks
    /// are fully credited so later writes can never recount them.
    pub fn restore_bitmap(&self, bits: &[u8], chunk_size: u64) {
        let file_size = self.total_size();
        let mut restored = ChunkBitmap::new(file_size, chunk_size);

        let mut verified = 0u64;
        for idx in 0..restored.chunk_count() {
            let present = bits
                .get(idx / 8)
                .is_some_and(|byte| byte & (1 << (idx % 8)) != 0);
            if present {
                restored.set_bit(idx);
                restored.credit[idx] = restored.chunk_len(idx);
                verified += restored.chunk_len(idx);
            }
        }

        *self.bitmap.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(restored);
        self.verified.store(verified, Ordering::SeqCst);
    }

    /// Reconcile counters against the exact remaining work after a resume.
    ///
    /// `downloaded` becomes `total - sum(remaining)`, and chunks partially
    /// covered by remaining tasks receive a credit for the bytes already
    /// present so their completion adds only the rest.
    pub fn recalculate_progress(&self, remaining: &[Task]) {
        let total = self.total_size();
        let remaining_bytes: u64 = remaining.iter().map(|t| t.length).sum();
        let computed = total.saturating_sub(remaining_bytes);

        let mut guard = self.bitmap.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(bitmap) = guard.as_mut() {
            for idx in 0..bitmap.chunk_count() {
                if bitmap.bit(idx) {
                    continue;
                }
                let chunk_start = idx as u64 * bitmap.chunk_size;
                let chunk_end = chunk_start + bitmap.chunk_len(idx);

                let missing: u64 = remaining
                    .iter()
                    .map(|t| t.end().min(chunk_end).saturating_sub(t.offset.max(chunk_start)))
                    .sum();
                bitmap.credit[idx] = bitmap.chunk_len(idx).saturating_sub(missing);
            }
        }
        drop(guard);

        self.downloaded.store(computed, Ordering::SeqCst);
    }

    /// Snapshot the bitmap bits and chunk size for persistence
    pub fn bitmap_snapshot(&self) -> Option<(Vec<u8>, u64)> {
        let guard = self.bitmap.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.as_ref().map(|b| (b.bits.clone(), b.chunk_size))
    }

    /// Whether every chunk bit is set
    pub fn bitmap_complete(&self) -> bool {
        let guard = self.bitmap.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.as_ref() {
            Some(bitmap) => (0..bitmap.chunk_count()).all(|idx| bitmap.bit(idx)),
            None => false,
        }
    }

    /// Reset the session clock so live speed ignores pre-resume bytes
    pub fn sync_session_start(&self) {
        let mut session = self.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        session.session_start = Instant::now();
        session.session_base = self.downloaded();
    }

    /// Carry elapsed time from previous sessions
    pub fn set_saved_elapsed(&self, elapsed: Duration) {
        let mut session = self.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        session.saved_elapsed = elapsed;
    }

    /// Elapsed time saved from previous sessions
    pub fn saved_elapsed(&self) -> Duration {
        self.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner).saved_elapsed
    }

    /// Total elapsed time including the current session
    pub fn elapsed(&self) -> Duration {
        let session = self.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        session.saved_elapsed + session.session_start.elapsed()
    }

    /// Live session speed in bytes per second
    pub fn speed_bps(&self) -> u64 {
        let session = self.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let secs = session.session_start.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        let session_bytes = self.downloaded().saturating_sub(session.session_base);
        (session_bytes as f64 / secs) as u64
    }

    /// Store the cancel handle that [`pause`](Self::pause) fires
    pub fn set_cancel_token(&self, token: CancellationToken) {
        *self.cancel.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);
    }

    /// Set the pause flag and cancel the in-flight download
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        if let Some(token) = self.cancel.lock().unwrap_or_else(std::sync::PoisonError::into_inner).as_ref() {
            token.cancel();
        }
    }

    /// Whether the pause flag is set
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Align in-memory counters with the persisted pause snapshot
    pub fn finalize_pause(&self, computed_downloaded: u64, total_elapsed: Duration) {
        self.downloaded.store(computed_downloaded, Ordering::SeqCst);
        let mut session = self.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        session.saved_elapsed = total_elapsed;
    }

    /// Replace the per-source status list
    pub fn set_mirrors(&self, statuses: Vec<MirrorStatus>) {
        *self.mirrors.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = statuses;
    }

    /// Snapshot of the per-source status list
    pub fn mirrors(&self) -> Vec<MirrorStatus> {
        self.mirrors.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// URLs workers may currently select
    pub fn live_mirrors(&self) -> Vec<String> {
        self.mirrors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|m| m.active && !m.error)
            .map(|m| m.url.clone())
            .collect()
    }

    /// Degrade one source after repeated failures. Returns whether anything
    /// changed (the last remaining source is never degraded).
    pub fn report_mirror_error(&self, url: &str) -> bool {
        let mut mirrors = self.mirrors.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let healthy = mirrors.iter().filter(|m| m.active && !m.error).count();
        if healthy <= 1 {
            return false;
        }
        for status in mirrors.iter_mut() {
            if status.url == url && !status.error {
                status.error = true;
                status.active = false;
                return true;
            }
        }
        false
    }
}
