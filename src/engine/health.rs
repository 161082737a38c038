//! Worker health monitoring: stall detection and slow-worker flagging.
//!
//! Every sweep compares each worker's decayed speed against the fleet
//! median. Stalled workers (no bytes for longer than the stall timeout) get
//! their in-flight request cancelled — the worker loop re-queues the
//! remaining range. Workers slow past their grace period are flagged
//! hedge-eligible for the balancer's next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeOptions;

use super::active::ActiveRegistry;
use super::balancer::median;

/// Spawn the health monitor background task.
pub(crate) fn spawn_health_monitor(
    registry: Arc<ActiveRegistry>,
    runtime: Arc<RuntimeOptions>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = HealthMonitor::new(registry, runtime);
        let mut interval = tokio::time::interval(monitor.runtime.health_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => monitor.sweep(),
                _ = cancel.cancelled() => return,
            }
        }
    })
}

/// Tracks how long each worker has been below the slow threshold.
pub(crate) struct HealthMonitor {
    registry: Arc<ActiveRegistry>,
    runtime: Arc<RuntimeOptions>,
    /// Worker considered slow since this instant, keyed by range offset
    /// (a worker picking up a new range resets its slow clock)
    slow_since: HashMap<u64, Instant>,
}

impl HealthMonitor {
    pub(crate) fn new(registry: Arc<ActiveRegistry>, runtime: Arc<RuntimeOptions>) -> Self {
        Self {
            registry,
            runtime,
            slow_since: HashMap::new(),
        }
    }

    /// One monitoring sweep over every active task.
    pub(crate) fn sweep(&mut self) {
        let snapshot = self.registry.snapshot();
        let originals: Vec<_> = snapshot.iter().filter(|t| !t.is_hedge_copy).collect();
        if originals.is_empty() {
            self.slow_since.clear();
            return;
        }

        let speeds: Vec<f64> = originals.iter().map(|t| t.speed()).collect();
        let fleet_median = median(&speeds);
        let now = Instant::now();
        let mut seen = Vec::with_capacity(originals.len());

        for active in &originals {
            let key = active.task.offset;
            seen.push(key);

            // Stall: no bytes for longer than the stall timeout
            if active.idle_for() > self.runtime.stall_timeout {
                tracing::warn!(
                    offset = active.task.offset,
                    idle_ms = active.idle_for().as_millis() as u64,
                    "Worker stalled, cancelling its request"
                );
                active.cancel.cancel();
                self.slow_since.remove(&key);
                continue;
            }

            // Slow: below the threshold fraction of the fleet median.
            // Needs at least two workers for a meaningful median.
            let slow = originals.len() > 1
                && fleet_median > 0.0
                && active.speed() < self.runtime.slow_worker_threshold * fleet_median;

            if slow {
                let since = self.slow_since.entry(key).or_insert(now);
                if now.duration_since(*since) >= self.runtime.slow_worker_grace {
                    if !active.hedge_hint.swap(true, Ordering::SeqCst) {
                        tracing::debug!(
                            offset = active.task.offset,
                            speed = active.speed(),
                            median = fleet_median,
                            "Worker chronically slow, flagging for hedge"
                        );
                    }
                }
            } else {
                self.slow_since.remove(&key);
            }
        }

        // Forget workers that finished their range
        self.slow_since.retain(|key, _| seen.contains(key));
    }
}
