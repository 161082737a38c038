//! The balancer: keeps idle workers fed via splitting, stealing, and hedging.
//!
//! Runs every 200 ms. While idle workers exist and the queue is empty it
//! first tries to steal the tail half of the largest in-flight range, and
//! when no split is viable it hedges the slowest worker by pushing a
//! duplicate of its remaining range. A steal preserves the partition; a
//! hedge deliberately overlaps but is bounded to one duplicate per task and
//! excluded from accounting.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeOptions;

use super::active::ActiveRegistry;
use super::task_queue::{QueueItem, TaskQueue};

/// Balancer tick interval
const BALANCE_INTERVAL: Duration = Duration::from_millis(200);

/// Spawn the balancer background task.
pub(crate) fn spawn_balancer(
    queue: Arc<TaskQueue>,
    registry: Arc<ActiveRegistry>,
    runtime: Arc<RuntimeOptions>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BALANCE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    balance_once(&queue, &registry, &runtime);
                }
                _ = cancel.cancelled() => return,
            }
        }
    })
}

/// One balancing pass: fill idle workers until nothing more can be produced.
pub(crate) fn balance_once(
    queue: &TaskQueue,
    registry: &ActiveRegistry,
    runtime: &RuntimeOptions,
) {
    while queue.idle_workers() > 0 {
        // Queued work will feed the idle worker by itself
        if !queue.is_empty() {
            break;
        }

        if try_steal(queue, registry, runtime) {
            continue;
        }
        if try_hedge(queue, registry, runtime) {
            continue;
        }
        break;
    }
}

/// Steal the tail half of the largest remaining in-flight range.
fn try_steal(queue: &TaskQueue, registry: &ActiveRegistry, runtime: &RuntimeOptions) -> bool {
    let snapshot = registry.snapshot();

    // Largest remaining range first; hedge copies are not steal victims
    let victim = snapshot
        .iter()
        .filter(|t| !t.is_hedge_copy)
        .max_by_key(|t| t.remaining_bytes());

    let Some(victim) = victim else { return false };
    let Some(stolen) = victim.steal_half(runtime.min_chunk_size) else {
        return false;
    };

    tracing::debug!(
        offset = stolen.offset,
        length = stolen.length,
        "Stole range suffix for an idle worker"
    );
    queue.push(QueueItem::new(stolen));
    true
}

/// Duplicate the remaining range of the slowest below-threshold worker.
fn try_hedge(queue: &TaskQueue, registry: &ActiveRegistry, runtime: &RuntimeOptions) -> bool {
    let snapshot = registry.snapshot();

    let speeds: Vec<f64> = snapshot
        .iter()
        .filter(|t| !t.is_hedge_copy)
        .map(|t| t.speed())
        .collect();
    if speeds.is_empty() {
        return false;
    }
    let median = median(&speeds);

    // Health-monitor hints first, then anything below the slow threshold
    let mut candidates: Vec<_> = snapshot
        .iter()
        .filter(|t| !t.is_hedge_copy)
        .filter(|t| !t.hedged.load(Ordering::SeqCst))
        .filter(|t| t.remaining_bytes() > 0)
        .filter(|t| {
            t.hedge_hint.load(Ordering::SeqCst)
                || (median > 0.0 && t.speed() < runtime.slow_worker_threshold * median)
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.speed()
            .partial_cmp(&b.speed())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for candidate in candidates {
        // One duplicate per task, ever
        if candidate
            .hedged
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            continue;
        }
        let Some(task) = candidate.remaining_task() else {
            continue;
        };
        tracing::debug!(
            offset = task.offset,
            length = task.length,
            speed = candidate.speed(),
            "Hedging a slow worker's remaining range"
        );
        queue.push(QueueItem {
            task,
            attempt: 0,
            hedge: true,
        });
        return true;
    }
    false
}

/// Median of a non-empty slice
pub(crate) fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::active::ActiveTask;
    use crate::types::Task;

    const MIB: u64 = 1024 * 1024;

    fn runtime() -> RuntimeOptions {
        RuntimeOptions::default()
    }

    #[tokio::test]
    async fn no_idle_workers_means_no_action() {
        let queue = TaskQueue::new();
        let registry = ActiveRegistry::new();
        registry.insert(0, Arc::new(ActiveTask::new(Task::new(0, 16 * MIB), false)));

        balance_once(&queue, &registry, &runtime());
        assert_eq!(queue.len(), 0, "nothing idle, nothing to fill");
    }

    #[tokio::test]
    async fn steal_splits_the_largest_range() {
        let queue = Arc::new(TaskQueue::new());
        let registry = ActiveRegistry::new();
        let small = Arc::new(ActiveTask::new(Task::new(0, 4 * MIB), false));
        let large = Arc::new(ActiveTask::new(Task::new(4 * MIB, 16 * MIB), false));
        registry.insert(0, small.clone());
        registry.insert(1, large.clone());

        // Park a fake idle worker on the queue
        let idle = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        balance_once(&queue, &registry, &runtime());

        let outcome = tokio::time::timeout(Duration::from_secs(1), idle)
            .await
            .unwrap()
            .unwrap();
        let item = match outcome {
            super::super::task_queue::PopOutcome::Item(item) => item,
            other => panic!("expected stolen item, got {other:?}"),
        };

        // The stolen suffix must come from the larger range and abut its new stop
        let (_, stop) = large.position();
        assert_eq!(item.task.offset, stop);
        assert_eq!(item.task.end(), 20 * MIB);
        assert!(!item.hedge);
        assert_eq!(
            small.remaining_bytes(),
            4 * MIB,
            "the smaller range must be untouched"
        );
    }

    #[tokio::test]
    async fn hedge_fires_when_no_split_is_viable() {
        let queue = Arc::new(TaskQueue::new());
        let registry = ActiveRegistry::new();
        // Too small to split at the default 2 MiB minimum
        let slow = Arc::new(ActiveTask::new(Task::new(0, 3 * MIB), false));
        slow.hedge_hint.store(true, Ordering::SeqCst);
        registry.insert(0, slow.clone());

        let idle = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        balance_once(&queue, &registry, &runtime());

        let outcome = tokio::time::timeout(Duration::from_secs(1), idle)
            .await
            .unwrap()
            .unwrap();
        let item = match outcome {
            super::super::task_queue::PopOutcome::Item(item) => item,
            other => panic!("expected hedge item, got {other:?}"),
        };
        assert!(item.hedge, "the duplicate must be flagged as a hedge");
        assert_eq!(item.task, Task::new(0, 3 * MIB));
        assert!(
            slow.hedged.load(Ordering::SeqCst),
            "the victim must be marked hedged"
        );
    }

    #[tokio::test]
    async fn a_task_is_hedged_at_most_once() {
        let queue = Arc::new(TaskQueue::new());
        let registry = ActiveRegistry::new();
        let slow = Arc::new(ActiveTask::new(Task::new(0, 3 * MIB), false));
        slow.hedge_hint.store(true, Ordering::SeqCst);
        registry.insert(0, slow.clone());

        let rt = runtime();
        assert!(try_hedge(&queue, &registry, &rt), "first hedge fires");
        assert!(
            !try_hedge(&queue, &registry, &rt),
            "the hedged flag must block a second duplicate"
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn hedge_copies_are_never_victims() {
        let queue = Arc::new(TaskQueue::new());
        let registry = ActiveRegistry::new();
        let copy = Arc::new(ActiveTask::new(Task::new(0, 32 * MIB), true));
        copy.hedge_hint.store(true, Ordering::SeqCst);
        registry.insert(0, copy);

        let rt = runtime();
        assert!(!try_steal(&queue, &registry, &rt));
        assert!(!try_hedge(&queue, &registry, &rt));
    }

    #[test]
    fn median_of_odd_and_even_sets() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&[5.0]), 5.0);
    }
}
