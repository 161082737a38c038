//! Per-worker registry of in-flight ranges.
//!
//! An [`ActiveTask`] is bound to a worker while it processes a range and
//! exposes enough state for health checks (speed, last activity) and work
//! stealing (cursor, stop point). The write cursor and stop point live under
//! one mutex so claims and steals serialize: at any moment at most one
//! non-hedged task owns a byte, and a steal can never hand out bytes a
//! worker has already claimed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ALIGN_SIZE;
use crate::types::Task;

/// Speed readings older than this are decayed so idle connections cannot
/// mask stalls.
const SPEED_DECAY_THRESHOLD: Duration = Duration::from_secs(2);

/// Minimum window before the EMA folds in a new instantaneous sample
const SPEED_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Cursor {
    current: u64,
    stop: u64,
}

#[derive(Debug)]
struct SpeedWindowState {
    ema: f64,
    window_start: Instant,
    window_bytes: u64,
}

/// A task currently being processed by a worker.
#[derive(Debug)]
pub(crate) struct ActiveTask {
    /// The range as originally popped
    pub task: Task,
    cursor: Mutex<Cursor>,
    /// Milliseconds since `started_at` of the last byte received (0 = never)
    last_activity_ms: AtomicU64,
    speed: Mutex<SpeedWindowState>,
    /// When this worker began the range
    pub started_at: Instant,
    /// Cancels the in-flight request only (stall handling); the download-wide
    /// token is separate
    pub cancel: CancellationToken,
    /// Set once a hedged duplicate has been pushed for this task
    pub hedged: AtomicBool,
    /// Health monitor suggestion: this worker has been slow past its grace
    pub hedge_hint: AtomicBool,
    /// This ActiveTask is itself a hedged duplicate and never accounts
    pub is_hedge_copy: bool,
}

impl ActiveTask {
    /// Bind a task to a worker
    pub fn new(task: Task, is_hedge_copy: bool) -> Self {
        Self {
            task,
            cursor: Mutex::new(Cursor {
                current: task.offset,
                stop: task.end(),
            }),
            last_activity_ms: AtomicU64::new(0),
            speed: Mutex::new(SpeedWindowState {
                ema: 0.0,
                window_start: Instant::now(),
                window_bytes: 0,
            }),
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            hedged: AtomicBool::new(false),
            hedge_hint: AtomicBool::new(false),
            is_hedge_copy,
        }
    }

    /// Current cursor and stop point
    pub fn position(&self) -> (u64, u64) {
        let cursor = self.cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        (cursor.current, cursor.stop)
    }

    /// Claim up to `want` bytes for writing at the current cursor.
    ///
    /// Returns `(offset, granted)`. The cursor advances by `granted`
    /// immediately, so a concurrent steal can only take bytes past the claim.
    /// `granted == 0` means the range is done (the stop point moved down to
    /// or below the cursor).
    pub fn claim(&self, want: u64) -> (u64, u64) {
        let mut cursor = self.cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let offset = cursor.current;
        let granted = want.min(cursor.stop.saturating_sub(cursor.current));
        cursor.current += granted;
        (offset, granted)
    }

    /// Whether the cursor has reached the stop point
    pub fn is_done(&self) -> bool {
        let cursor = self.cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cursor.current >= cursor.stop
    }

    /// Bytes between the cursor and the stop point
    pub fn remaining_bytes(&self) -> u64 {
        let cursor = self.cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cursor.stop.saturating_sub(cursor.current)
    }

    /// The unfinished part of the range, if any
    pub fn remaining_task(&self) -> Option<Task> {
        let cursor = self.cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if cursor.current >= cursor.stop {
            None
        } else {
            Some(Task::new(cursor.current, cursor.stop - cursor.current))
        }
    }

    /// Steal the aligned tail half of this range.
    ///
    /// Lowers the stop point by an aligned half and returns the stolen suffix
    /// as a fresh task. Returns `None` when the remainder is below
    /// `2 * min_chunk` (splitting would create undersized chunks). The owner
    /// observes the lowered stop point on its next claim and exits cleanly.
    pub fn steal_half(&self, min_chunk: u64) -> Option<Task> {
        let mut cursor = self.cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let remaining = cursor.stop.saturating_sub(cursor.current);
        if remaining < 2 * min_chunk {
            return None;
        }

        let half = (remaining / 2 / ALIGN_SIZE) * ALIGN_SIZE;
        if half < min_chunk {
            return None;
        }

        let new_stop = cursor.stop - half;
        let stolen = Task::new(new_stop, half);
        cursor.stop = new_stop;
        Some(stolen)
    }

    /// Record received bytes: bumps last-activity and folds the windowed
    /// instantaneous speed into the EMA once per window.
    pub fn record_bytes(&self, n: u64, alpha: f64) {
        self.last_activity_ms.store(
            self.started_at.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );

        let mut speed = self.speed.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        speed.window_bytes += n;

        let window = speed.window_start.elapsed();
        if window >= SPEED_WINDOW {
            let instantaneous = speed.window_bytes as f64 / window.as_secs_f64();
            speed.ema = if speed.ema == 0.0 {
                instantaneous
            } else {
                alpha * instantaneous + (1.0 - alpha) * speed.ema
            };
            speed.window_start = Instant::now();
            speed.window_bytes = 0;
        }
    }

    /// Decayed speed estimate in bytes per second.
    ///
    /// A worker silent for longer than 2 s has its stored EMA multiplied by
    /// `2s / silence` so an idle connection cannot report a healthy speed.
    pub fn speed(&self) -> f64 {
        let ema = self.speed.lock().unwrap_or_else(std::sync::PoisonError::into_inner).ema;

        let last_ms = self.last_activity_ms.load(Ordering::Relaxed);
        if last_ms == 0 {
            return ema;
        }

        let silence = self
            .started_at
            .elapsed()
            .saturating_sub(Duration::from_millis(last_ms));
        if silence > SPEED_DECAY_THRESHOLD {
            let decay = SPEED_DECAY_THRESHOLD.as_secs_f64() / silence.as_secs_f64();
            return ema * decay;
        }
        ema
    }

    /// Time since the last byte arrived, measured from range start when no
    /// byte has arrived yet.
    pub fn idle_for(&self) -> Duration {
        let last_ms = self.last_activity_ms.load(Ordering::Relaxed);
        self.started_at
            .elapsed()
            .saturating_sub(Duration::from_millis(last_ms))
    }
}

/// Registry of the ranges currently bound to workers, keyed by worker ID.
#[derive(Debug, Default)]
pub(crate) struct ActiveRegistry {
    tasks: Mutex<HashMap<usize, std::sync::Arc<ActiveTask>>>,
}

impl ActiveRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a worker to a task
    pub fn insert(&self, worker_id: usize, task: std::sync::Arc<ActiveTask>) {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(worker_id, task);
    }

    /// Release a worker's binding
    pub fn remove(&self, worker_id: usize) {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&worker_id);
    }

    /// Snapshot of all active tasks
    pub fn snapshot(&self) -> Vec<std::sync::Arc<ActiveTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Remaining ranges of all non-hedge workers (pause snapshot)
    pub fn remaining_tasks(&self) -> Vec<Task> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|t| !t.is_hedge_copy)
            .filter_map(|t| t.remaining_task())
            .collect()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn claim_advances_the_cursor_and_clamps_at_stop() {
        let active = ActiveTask::new(Task::new(0, 100), false);

        let (offset, granted) = active.claim(64);
        assert_eq!((offset, granted), (0, 64));

        let (offset, granted) = active.claim(64);
        assert_eq!((offset, granted), (64, 36), "claims clamp at the stop point");

        let (_, granted) = active.claim(64);
        assert_eq!(granted, 0, "a finished range grants nothing");
        assert!(active.is_done());
    }

    #[test]
    fn steal_half_preserves_the_partition() {
        let active = ActiveTask::new(Task::new(0, 8 * MIB), false);

        let stolen = active.steal_half(2 * MIB).expect("8 MiB splits at 2 MiB min");
        let (current, stop) = active.position();

        assert_eq!(current, 0);
        assert_eq!(
            stop, stolen.offset,
            "victim's new stop must meet the stolen suffix exactly"
        );
        assert_eq!(
            stop + stolen.length,
            8 * MIB,
            "no bytes may be lost or duplicated by the split"
        );
        assert_eq!(stolen.offset % ALIGN_SIZE, 0, "split point must be aligned");
    }

    #[test]
    fn steal_refuses_undersized_remainders() {
        let active = ActiveTask::new(Task::new(0, 3 * MIB), false);
        assert!(
            active.steal_half(2 * MIB).is_none(),
            "3 MiB < 2 * min_chunk, splitting would create undersized chunks"
        );
    }

    #[test]
    fn steal_cannot_take_already_claimed_bytes() {
        let active = ActiveTask::new(Task::new(0, 8 * MIB), false);
        active.claim(3 * MIB);

        if let Some(stolen) = active.steal_half(2 * MIB) {
            let (current, _) = active.position();
            assert!(
                stolen.offset >= current,
                "stolen range must start at or past the claim cursor"
            );
        }
    }

    #[test]
    fn remaining_task_reflects_claims() {
        let active = ActiveTask::new(Task::new(100, 50), false);
        active.claim(20);
        assert_eq!(active.remaining_task(), Some(Task::new(120, 30)));

        active.claim(30);
        assert_eq!(active.remaining_task(), None);
    }

    #[test]
    fn speed_starts_at_zero_and_ignores_decay_before_first_byte() {
        let active = ActiveTask::new(Task::new(0, 100), false);
        assert_eq!(active.speed(), 0.0);
    }

    #[test]
    fn registry_snapshot_and_remaining_skip_hedge_copies() {
        let registry = ActiveRegistry::new();
        registry.insert(0, Arc::new(ActiveTask::new(Task::new(0, 100), false)));
        registry.insert(1, Arc::new(ActiveTask::new(Task::new(100, 100), true)));

        assert_eq!(registry.snapshot().len(), 2);
        let remaining = registry.remaining_tasks();
        assert_eq!(
            remaining,
            vec![Task::new(0, 100)],
            "hedge duplicates must never appear in the pause snapshot"
        );

        registry.remove(0);
        assert!(registry.remaining_tasks().is_empty());
    }
}
