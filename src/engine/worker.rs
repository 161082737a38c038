//! The worker loop: pop a range, fetch it, write it at its offset.
//!
//! Each worker owns a reusable streaming buffer and walks the transport
//! chain on protocol-level failures. Writes are offset-addressed positional
//! writes, so no worker ever assumes the file pointer position and two
//! workers never write the same byte unless a hedge is racing.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeOptions;
use crate::error::{DownloadError, Error, status_is_retryable};

use super::active::{ActiveRegistry, ActiveTask};
use super::progress::ProgressState;
use super::task_queue::{PopOutcome, QueueItem, TaskQueue};
use super::transport::{ClientSet, Protocol};

/// Consecutive failures on one mirror before it is reported as degraded
const MIRROR_FAILURE_LIMIT: u32 = 2;

/// Everything a worker shares with the rest of the engine.
pub(crate) struct WorkerContext {
    /// Worker index, keys the active registry
    pub worker_id: usize,
    /// Pending ranges
    pub queue: Arc<TaskQueue>,
    /// In-flight range registry
    pub registry: Arc<ActiveRegistry>,
    /// Shared counters and bitmap
    pub state: Arc<ProgressState>,
    /// Protocol clients
    pub clients: Arc<ClientSet>,
    /// Engine tuning
    pub runtime: Arc<RuntimeOptions>,
    /// Caller headers forwarded verbatim
    pub headers: Arc<HashMap<String, String>>,
    /// The working file, written with positional writes
    pub file: Arc<File>,
    /// Round-robin cursor over live mirrors, shared by all workers
    pub mirror_cursor: Arc<AtomicUsize>,
    /// Primary URL (always usable even when every mirror degraded)
    pub primary_url: String,
    /// Download-wide cancellation (pause or delete)
    pub cancel: CancellationToken,
    /// Fatal errors surface here for the coordinator
    pub errors: mpsc::Sender<Error>,
}

/// What happened to one range attempt.
enum RangeResult {
    /// The range reached its stop point
    Done,
    /// Transient failure: re-queue the remaining bytes with this attempt count
    Requeue { attempt: u32 },
    /// The download-wide context was cancelled; exit without re-queueing
    DownloadCancelled,
    /// Unrecoverable; the coordinator decides the download's fate
    Fatal(Error),
}

/// One worker: a streaming buffer plus per-worker failure bookkeeping.
pub(crate) struct Worker {
    ctx: WorkerContext,
    buffer: Vec<u8>,
    /// Consecutive failures per mirror URL
    mirror_failures: HashMap<String, u32>,
    /// Protocols whose fallback has already been logged by this worker
    reported_protocols: HashSet<Protocol>,
}

impl Worker {
    /// Create a worker with its reusable buffer
    pub fn new(ctx: WorkerContext) -> Self {
        let capacity = ctx.runtime.worker_buffer_size;
        Self {
            ctx,
            buffer: Vec::with_capacity(capacity),
            mirror_failures: HashMap::new(),
            reported_protocols: HashSet::new(),
        }
    }

    /// The worker loop. Exits when the queue closes, the download context is
    /// cancelled, or a fatal error has been escalated.
    pub async fn run(mut self) {
        loop {
            let outcome = tokio::select! {
                outcome = self.ctx.queue.pop() => outcome,
                _ = self.ctx.cancel.cancelled() => return,
            };

            let item = match outcome {
                PopOutcome::Item(item) => item,
                PopOutcome::Closed => return,
            };

            let active = Arc::new(ActiveTask::new(item.task, item.hedge));
            self.ctx.registry.insert(self.ctx.worker_id, active.clone());

            let result = self.run_range(&active, &item).await;

            // Capture the remainder before releasing the registry slot
            let remaining = active.remaining_task();

            match result {
                RangeResult::Done => {
                    self.ctx.registry.remove(self.ctx.worker_id);
                }
                RangeResult::DownloadCancelled => {
                    // Pause/delete: leave the registry entry in place so the
                    // coordinator can snapshot the unfinished range. Hedge
                    // copies never contribute to the snapshot.
                    if item.hedge {
                        self.ctx.registry.remove(self.ctx.worker_id);
                    }
                    return;
                }
                RangeResult::Requeue { attempt } => {
                    self.ctx.registry.remove(self.ctx.worker_id);
                    // Hedged duplicates never re-queue; the original (or its
                    // own requeue) still owns the range
                    if item.hedge {
                        continue;
                    }
                    let Some(task) = remaining else { continue };
                    if attempt > self.ctx.runtime.max_task_retries {
                        let err = Error::Download(DownloadError::RetriesExhausted {
                            offset: task.offset,
                            attempts: attempt,
                            reason: "transient failures exceeded the retry budget".to_string(),
                        });
                        let _ = self.ctx.errors.try_send(err);
                        return;
                    }
                    tracing::debug!(
                        worker = self.ctx.worker_id,
                        offset = task.offset,
                        length = task.length,
                        attempt,
                        "Re-queueing range after transient failure"
                    );
                    self.ctx.queue.push(QueueItem {
                        task,
                        attempt,
                        hedge: false,
                    });
                }
                RangeResult::Fatal(err) => {
                    self.ctx.registry.remove(self.ctx.worker_id);
                    let _ = self.ctx.errors.try_send(err);
                    return;
                }
            }
        }
    }

    /// Fetch one range, walking the protocol chain on transport failures.
    async fn run_range(&mut self, active: &ActiveTask, item: &QueueItem) -> RangeResult {
        let url = self.next_mirror();

        let clients: Vec<_> = self
            .ctx
            .clients
            .chain()
            .map(|c| (c.protocol, c.client.clone()))
            .collect();
        let last = clients.len() - 1;

        for (i, (protocol, client)) in clients.into_iter().enumerate() {
            let (current, stop) = active.position();
            if current >= stop {
                return RangeResult::Done;
            }

            let mut request = client
                .get(&url)
                .header(reqwest::header::RANGE, format!("bytes={}-{}", current, stop - 1));
            for (key, value) in self.ctx.headers.iter() {
                request = request.header(key, value);
            }

            let response = tokio::select! {
                response = request.send() => response,
                _ = active.cancel.cancelled() => {
                    return RangeResult::Requeue { attempt: item.attempt + 1 };
                }
                _ = self.ctx.cancel.cancelled() => return RangeResult::DownloadCancelled,
            };

            match response {
                Ok(response) => {
                    self.mirror_failures.remove(&url);
                    return self.stream_response(active, item, &url, response).await;
                }
                Err(e) if i < last && is_protocol_fallback_error(&e) => {
                    if self.reported_protocols.insert(protocol) {
                        tracing::warn!(
                            worker = self.ctx.worker_id,
                            %protocol,
                            error = %e,
                            "Protocol failed at the transport layer, falling back"
                        );
                    }
                    continue;
                }
                Err(e) => {
                    self.note_mirror_failure(&url);
                    tracing::debug!(
                        worker = self.ctx.worker_id,
                        url = %url,
                        error = %e,
                        "Range request failed"
                    );
                    return RangeResult::Requeue { attempt: item.attempt + 1 };
                }
            }
        }

        RangeResult::Requeue { attempt: item.attempt + 1 }
    }

    /// Stream a response body into the working file.
    async fn stream_response(
        &mut self,
        active: &ActiveTask,
        item: &QueueItem,
        url: &str,
        mut response: reqwest::Response,
    ) -> RangeResult {
        let status = response.status().as_u16();

        match status {
            206 => {}
            200 => {
                // The server ignored the range; the coordinator falls back
                // to a single-connection transfer
                return RangeResult::Fatal(Error::Download(DownloadError::RangeIgnored {
                    url: url.to_string(),
                }));
            }
            416 => {
                let (current, stop) = active.position();
                return RangeResult::Fatal(Error::Download(
                    DownloadError::RangeNotSatisfiable {
                        url: url.to_string(),
                        offset: current,
                        end: stop.saturating_sub(1),
                    },
                ));
            }
            s if status_is_retryable(s) => {
                self.note_mirror_failure(url);
                return RangeResult::Requeue { attempt: item.attempt + 1 };
            }
            s => {
                // 4xx: fatal for this source; other sources may continue
                return self.fail_source(url, s, item);
            }
        }

        let expected = active.remaining_bytes();
        let mut received = 0u64;

        loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk,
                _ = active.cancel.cancelled() => {
                    // Stall cancellation: persist what we buffered, then let
                    // the remainder re-queue
                    if let Err(e) = self.flush(active, item.hedge) {
                        return RangeResult::Fatal(e);
                    }
                    return RangeResult::Requeue { attempt: item.attempt + 1 };
                }
                _ = self.ctx.cancel.cancelled() => {
                    // Pause/delete: the coordinator snapshots remaining work
                    if let Err(e) = self.flush(active, item.hedge) {
                        return RangeResult::Fatal(e);
                    }
                    return RangeResult::DownloadCancelled;
                }
            };

            match chunk {
                Ok(Some(bytes)) => {
                    received += bytes.len() as u64;
                    let mut rest = &bytes[..];
                    while !rest.is_empty() {
                        let space = self.ctx.runtime.worker_buffer_size - self.buffer.len();
                        let take = space.min(rest.len());
                        self.buffer.extend_from_slice(&rest[..take]);
                        rest = &rest[take..];

                        if self.buffer.len() >= self.ctx.runtime.worker_buffer_size {
                            match self.flush(active, item.hedge) {
                                Ok(true) => {}
                                Ok(false) => return RangeResult::Done,
                                Err(e) => return RangeResult::Fatal(e),
                            }
                        }
                    }
                    if active.is_done() {
                        return RangeResult::Done;
                    }
                }
                Ok(None) => {
                    match self.flush(active, item.hedge) {
                        Ok(_) => {}
                        Err(e) => return RangeResult::Fatal(e),
                    }
                    if active.is_done() {
                        return RangeResult::Done;
                    }
                    // The body ended before the range did
                    tracing::debug!(
                        worker = self.ctx.worker_id,
                        url = %url,
                        expected,
                        received,
                        "Short read, re-queueing remainder"
                    );
                    self.note_mirror_failure(url);
                    return RangeResult::Requeue { attempt: item.attempt + 1 };
                }
                Err(e) => {
                    if let Err(flush_err) = self.flush(active, item.hedge) {
                        return RangeResult::Fatal(flush_err);
                    }
                    self.note_mirror_failure(url);
                    tracing::debug!(
                        worker = self.ctx.worker_id,
                        url = %url,
                        error = %e,
                        "Body stream failed, re-queueing remainder"
                    );
                    return RangeResult::Requeue { attempt: item.attempt + 1 };
                }
            }
        }
    }

    /// Write the buffered bytes at the claimed offset.
    ///
    /// Claims advance the cursor atomically, so bytes past a lowered stop
    /// point are discarded. Returns `Ok(false)` when the range finished under
    /// the buffer (a steal shrank it). Only non-hedged writers account bytes.
    fn flush(&mut self, active: &ActiveTask, hedge: bool) -> Result<bool, Error> {
        if self.buffer.is_empty() {
            return Ok(true);
        }

        let wanted = self.buffer.len() as u64;
        let (offset, granted) = active.claim(wanted);

        if granted > 0 {
            write_at(&self.ctx.file, &self.buffer[..granted as usize], offset)?;
            active.record_bytes(granted, self.ctx.runtime.speed_ema_alpha);
            if !hedge {
                self.ctx.state.mark_bytes(offset, granted);
            }
        }

        self.buffer.clear();
        Ok(granted == wanted)
    }

    /// Round-robin over the live mirror list
    fn next_mirror(&self) -> String {
        let live = self.ctx.state.live_mirrors();
        if live.is_empty() {
            return self.ctx.primary_url.clone();
        }
        let idx = self
            .ctx
            .mirror_cursor
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        live[idx % live.len()].clone()
    }

    /// Count a failure against a mirror; degrade it after repeated failures
    fn note_mirror_failure(&mut self, url: &str) {
        let count = self.mirror_failures.entry(url.to_string()).or_insert(0);
        *count += 1;
        if *count >= MIRROR_FAILURE_LIMIT && self.ctx.state.report_mirror_error(url) {
            tracing::warn!(url, failures = *count, "Mirror degraded after repeated failures");
            self.mirror_failures.remove(url);
        }
    }

    /// Handle a status that is fatal for one source.
    fn fail_source(&mut self, url: &str, status: u16, item: &QueueItem) -> RangeResult {
        let degraded = self.ctx.state.report_mirror_error(url);
        let live = self.ctx.state.live_mirrors();

        // This source is out of rotation (just now, or by a racing worker)
        // while others survive: keep going. Degradation is monotonic, so not
        // charging the retry budget here cannot loop forever.
        if degraded || (!live.is_empty() && !live.iter().any(|u| u == url)) {
            tracing::warn!(url, status, "Source failed fatally, continuing on remaining sources");
            return RangeResult::Requeue {
                attempt: item.attempt,
            };
        }

        if live.is_empty() {
            return RangeResult::Fatal(Error::Download(DownloadError::AllSourcesFailed {
                url: self.ctx.primary_url.clone(),
            }));
        }

        RangeResult::Fatal(Error::Download(DownloadError::FatalStatus {
            url: url.to_string(),
            status,
        }))
    }
}

/// Whether a request error warrants trying the next protocol client rather
/// than a plain retry (handshake/connect/protocol-level breakage).
fn is_protocol_fallback_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_builder() || e.is_request() && !e.is_timeout()
}

/// Positional write that never moves the shared file cursor.
#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> Result<(), Error> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset).map_err(Error::Io)
}

/// Positional write that never moves the shared file cursor.
#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> Result<(), Error> {
    use std::os::windows::fs::FileExt;
    let mut written = 0usize;
    while written < buf.len() {
        let n = file
            .seek_write(&buf[written..], offset + written as u64)
            .map_err(Error::Io)?;
        written += n;
    }
    Ok(())
}
