//! Concurrent FIFO of pending byte ranges with idle-worker counting.
//!
//! Workers block in [`TaskQueue::pop`]; the balancer reads
//! [`TaskQueue::idle_workers`] to decide when to split, steal, or hedge.
//! There is no busy-wait: every state change wakes waiters, and after
//! [`TaskQueue::close`] every waiter returns [`PopOutcome::Closed`] in
//! bounded time.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::types::Task;

/// A queued byte range plus its execution metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueItem {
    /// The byte range to fetch
    pub task: Task,
    /// Transient-failure attempts already spent on this range
    pub attempt: u32,
    /// Hedged duplicate: races the original but never updates accounting
    pub hedge: bool,
}

impl QueueItem {
    /// A fresh, non-hedged item with no attempts spent
    pub fn new(task: Task) -> Self {
        Self {
            task,
            attempt: 0,
            hedge: false,
        }
    }
}

/// Result of a blocking pop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PopOutcome {
    /// A range to work on
    Item(QueueItem),
    /// The queue was closed; the worker should exit
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<QueueItem>,
    closed: bool,
}

/// Lock-guarded FIFO with an idle-worker counter.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    idle: AtomicUsize,
}

/// Keeps the idle counter honest even when a `pop` future is dropped
/// mid-wait (worker cancelled inside a `select!`).
struct IdleGuard<'a>(&'a AtomicUsize);

impl<'a> IdleGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskQueue {
    /// Create an empty, open queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue one item and wake a waiter
    pub fn push(&self, item: QueueItem) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if inner.closed {
                return;
            }
            inner.items.push_back(item);
        }
        self.notify.notify_waiters();
    }

    /// Enqueue many items and wake all waiters
    pub fn push_many<I: IntoIterator<Item = QueueItem>>(&self, items: I) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if inner.closed {
                return;
            }
            inner.items.extend(items);
        }
        self.notify.notify_waiters();
    }

    /// Dequeue the next item, waiting until one is available or the queue
    /// closes. Increments the idle counter for the duration of the wait.
    pub async fn pop(&self) -> PopOutcome {
        loop {
            // Register interest before the check so a push/close between the
            // check and the await cannot be lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(item) = inner.items.pop_front() {
                    return PopOutcome::Item(item);
                }
                if inner.closed {
                    return PopOutcome::Closed;
                }
            }

            let _idle = IdleGuard::new(&self.idle);
            notified.await;
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).items.len()
    }

    /// Whether no items are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of workers currently blocked in [`pop`](Self::pop)
    pub fn idle_workers(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    /// Atomically empty the queue and return what was pending
    pub fn drain_remaining(&self) -> Vec<QueueItem> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.items.drain(..).collect()
    }

    /// Close the queue: drop nothing, accept nothing, wake every waiter
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).closed
    }
}
