//! The coordinator: wires the probe, queue, workers, balancer, and health
//! monitor into one `download()` call and owns the end-of-life transitions
//! (complete, pause, cancel, error).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::{RetryConfig, RuntimeOptions};
use crate::db::Database;
use crate::error::{DownloadError, Error, Result};
use crate::retry::download_with_retry;
use crate::types::{DownloadId, DownloadOutcome, DownloadState, Event, MirrorStatus, Task};
use crate::utils;

use super::active::ActiveRegistry;
use super::probe::{self, ProbeOutcome};
use super::progress::ProgressState;
use super::sequential::{self, SequentialContext};
use super::sizing;
use super::task_queue::{QueueItem, TaskQueue};
use super::transport::ClientSet;
use super::worker::{Worker, WorkerContext};
use super::{balancer, health};

/// Completion watcher poll interval
const COMPLETION_POLL: Duration = Duration::from_millis(50);

/// Inputs for one download run.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    /// Download identifier
    pub id: DownloadId,
    /// Source URL
    pub url: String,
    /// Mirror candidates (probed before use)
    pub mirrors: Vec<String>,
    /// Destination: a directory (filename appended after the probe) or a
    /// full file path
    pub dest_path: PathBuf,
    /// Optional filename override
    pub filename: Option<String>,
    /// Headers forwarded verbatim on every request
    pub headers: HashMap<String, String>,
    /// Whether this run should adopt a persisted resume record
    pub is_resume: bool,
    /// Skip the concurrent engine entirely
    pub force_single: bool,
}

/// Shared services the engine runs against.
#[derive(Clone)]
pub struct EngineContext {
    /// Resume/history store
    pub db: Arc<Database>,
    /// Shared progress state (also the pause/cancel surface)
    pub state: Arc<ProgressState>,
    /// Event channel
    pub events: broadcast::Sender<Event>,
    /// Engine tuning
    pub runtime: Arc<RuntimeOptions>,
    /// Backoff policy for transient failures (probe retry, sequential restarts)
    pub retry: RetryConfig,
    /// Download-wide cancellation; `ProgressState::pause` cancels a child
    pub cancel: CancellationToken,
}

impl EngineContext {
    fn emit(&self, event: Event) {
        self.events.send(event).ok();
    }
}

/// Run one download to completion, pause, cancellation, or error.
///
/// Probes the source, resolves the destination, then either drives the
/// multi-connection engine or falls back to a single connection. On success
/// the working file is fsynced and atomically renamed into place; on pause
/// the exact remaining work is persisted for resume.
pub async fn download(req: DownloadRequest, ctx: EngineContext) -> Result<DownloadOutcome> {
    let probe_client = probe::probe_client(&ctx.runtime)?;

    // Probe, retrying a network-level failure at most once (the GET fallback
    // for ambiguous answers lives inside probe itself)
    let name_hint = req.filename.as_deref().filter(|n| !n.is_empty());
    let probe_retry = RetryConfig {
        max_attempts: 1,
        ..ctx.retry.clone()
    };
    let probed = download_with_retry(&probe_retry, || {
        probe::probe(&probe_client, &req.url, name_hint, &req.headers)
    })
    .await?;

    tracing::info!(
        url = %req.url,
        size = probed.size,
        supports_range = probed.supports_range,
        filename = %probed.filename,
        h2 = probed.supports_h2,
        h3 = probed.supports_h3,
        "Probe complete"
    );

    // Resolve the destination path and any resume record
    let candidate = if req.dest_path.is_dir() {
        req.dest_path.join(&probed.filename)
    } else {
        req.dest_path.clone()
    };

    let saved = if req.is_resume {
        ctx.db.load_state(&req.url, &candidate).await?
    } else {
        None
    };

    let dest = match &saved {
        // Resume keeps its resolved path; never generate a new unique name
        Some(state) => state.dest_path.clone(),
        None => {
            if req.is_resume && is_already_complete(&candidate, probed.size) {
                // Idempotent re-run: the file is already in place at the
                // right size
                tracing::info!(dest = %candidate.display(), "Destination already complete");
                return Ok(DownloadOutcome::Completed);
            }
            utils::unique_file_path(&candidate)
        }
    };
    let filename = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| probed.filename.clone());

    ctx.state.set_total_size(probed.size);
    ctx.db
        .update_resolution(req.id, &dest, &filename, probed.size)
        .await?;
    ctx.db.set_started(req.id).await?;

    ctx.emit(Event::Started {
        id: req.id,
        url: req.url.clone(),
        filename: filename.clone(),
        total: probed.size,
        dest_path: dest.clone(),
    });

    // Strategy selection
    let concurrent_viable =
        !req.force_single && !ctx.runtime.force_single && probed.supports_range && probed.size > 0;

    if concurrent_viable {
        match concurrent_download(&req, &ctx, &probed, &dest, &filename, saved).await {
            Err(Error::Download(DownloadError::RangeIgnored { url })) => {
                // The server advertised ranges but served whole bodies;
                // restart on a single connection
                tracing::warn!(url = %url, "Range ignored mid-transfer, falling back to single connection");
                sequential_download(&req, &ctx, &dest).await
            }
            other => other,
        }
    } else {
        tracing::debug!(url = %req.url, "Using single-connection downloader");
        sequential_download(&req, &ctx, &dest).await
    }
}

/// Whether `dest` already holds a complete file of the expected size (and no
/// working file claims it).
fn is_already_complete(dest: &Path, expected_size: u64) -> bool {
    expected_size > 0
        && !utils::working_path(dest).exists()
        && std::fs::metadata(dest)
            .map(|m| m.is_file() && m.len() == expected_size)
            .unwrap_or(false)
}

/// The multi-connection engine.
async fn concurrent_download(
    req: &DownloadRequest,
    ctx: &EngineContext,
    probed: &ProbeOutcome,
    dest: &Path,
    filename: &str,
    saved: Option<DownloadState>,
) -> Result<DownloadOutcome> {
    let file_size = probed.size;

    // Probe mirrors and publish the per-source status list
    resolve_mirrors(req, ctx, file_size).await;

    let working = utils::working_path(dest);
    let file = Arc::new(
        std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&working)?,
    );

    // Sizing
    let num_conns = sizing::initial_connections(file_size, &ctx.runtime);
    let chunk = sizing::chunk_size(file_size, num_conns, &ctx.runtime);

    // Seed from the resume record or from a fresh partition
    let tasks: Vec<Task> = match &saved {
        Some(state) => {
            ctx.state.store_downloaded(state.downloaded);
            ctx.state
                .set_saved_elapsed(Duration::from_nanos(state.elapsed_ns.max(0) as u64));

            if !state.chunk_bitmap.is_empty() && state.chunk_size > 0 {
                ctx.state.restore_bitmap(&state.chunk_bitmap, state.chunk_size);
                // Reconstruct per-chunk credit so partial chunks are never
                // recounted
                ctx.state.recalculate_progress(&state.tasks);
            } else {
                ctx.state.init_bitmap(file_size, chunk);
                ctx.state.recalculate_progress(&state.tasks);
            }
            ctx.state.sync_session_start();

            tracing::info!(
                tasks = state.tasks.len(),
                downloaded = state.downloaded,
                "Resuming from saved state"
            );
            state.tasks.clone()
        }
        None => {
            // Fresh download: preallocate and start the accounting at zero
            file.set_len(file_size)?;
            ctx.state.init_bitmap(file_size, chunk);
            ctx.state.store_downloaded(0);
            ctx.state.sync_session_start();
            sizing::create_tasks(file_size, chunk)
        }
    };

    let clients = Arc::new(ClientSet::build(
        &ctx.runtime,
        probed.supports_h2,
        probed.supports_h3,
    )?);

    let queue = Arc::new(TaskQueue::new());
    queue.push_many(tasks.iter().copied().map(QueueItem::new));

    let registry = Arc::new(ActiveRegistry::new());

    // One token governs the whole download; pause() cancels it through the
    // progress state
    let download_token = ctx.cancel.child_token();
    ctx.state.set_cancel_token(download_token.clone());

    // Helpers get their own token so they provably stop before we return
    let helper_token = CancellationToken::new();
    let balancer_handle = balancer::spawn_balancer(
        queue.clone(),
        registry.clone(),
        ctx.runtime.clone(),
        helper_token.clone(),
    );
    let health_handle = health::spawn_health_monitor(
        registry.clone(),
        ctx.runtime.clone(),
        helper_token.clone(),
    );

    // Workers
    let (error_tx, mut error_rx) = mpsc::channel::<Error>(num_conns);
    let mirror_cursor = Arc::new(AtomicUsize::new(0));
    let alive = Arc::new(AtomicUsize::new(num_conns));
    let headers = Arc::new(req.headers.clone());

    let mut worker_handles = Vec::with_capacity(num_conns);
    for worker_id in 0..num_conns {
        let worker_ctx = WorkerContext {
            worker_id,
            queue: queue.clone(),
            registry: registry.clone(),
            state: ctx.state.clone(),
            clients: clients.clone(),
            runtime: ctx.runtime.clone(),
            headers: headers.clone(),
            file: file.clone(),
            mirror_cursor: mirror_cursor.clone(),
            primary_url: req.url.clone(),
            cancel: download_token.clone(),
            errors: error_tx.clone(),
        };
        let alive = alive.clone();
        worker_handles.push(tokio::spawn(async move {
            Worker::new(worker_ctx).run().await;
            alive.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    drop(error_tx);

    // Completion watcher: closes the queue when nothing can make progress
    // anymore — everything drained, or every surviving worker idle
    let watcher_handle = {
        let queue = queue.clone();
        let registry = registry.clone();
        let alive = alive.clone();
        let token = download_token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(COMPLETION_POLL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let survivors = alive.load(Ordering::SeqCst);
                        let all_idle = queue.idle_workers() >= survivors;
                        if queue.is_empty()
                            && registry.snapshot().is_empty()
                            && (survivors == 0 || all_idle)
                        {
                            queue.close();
                            return;
                        }
                    }
                    _ = token.cancelled() => {
                        queue.close();
                        return;
                    }
                }
            }
        })
    };

    // Wait for the workforce, then stop the helpers before touching results
    for handle in worker_handles {
        let _ = handle.await;
    }
    queue.close();
    helper_token.cancel();
    let _ = watcher_handle.await;
    let _ = balancer_handle.await;
    let _ = health_handle.await;

    // Pause beats everything else: the state is snapshotted, not judged
    if ctx.state.is_paused() {
        return finalize_pause(req, ctx, file_size, dest, filename, &queue, &registry).await;
    }

    // Delete-style cancellation propagates as-is, no resume record
    if download_token.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // First fatal worker error decides the run; a range-ignored report wins
    // so the caller can fall back to a single connection
    let mut first_error: Option<Error> = None;
    while let Some(err) = error_rx.recv().await {
        if matches!(err, Error::Download(DownloadError::RangeIgnored { .. })) {
            return Err(err);
        }
        first_error.get_or_insert(err);
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    if ctx.state.downloaded() < file_size {
        return Err(Error::Download(DownloadError::ShortRead {
            offset: 0,
            expected: file_size,
            got: ctx.state.downloaded(),
        }));
    }

    // Final sync, then the atomic rename
    file.sync_all()?;
    drop(file);
    finalize_rename(&working, dest, file_size)?;

    ctx.db.delete_state(req.id).await?;

    Ok(DownloadOutcome::Completed)
}

/// Probe mirrors and publish the MirrorStatus list (failed probes stay
/// visible with `error = true`). Workers read the live set from the shared
/// state on every task.
async fn resolve_mirrors(req: &DownloadRequest, ctx: &EngineContext, file_size: u64) {
    let mut statuses = vec![MirrorStatus {
        url: req.url.clone(),
        active: true,
        error: false,
    }];

    let mut active = Vec::new();
    if !req.mirrors.is_empty() {
        let Ok(client) = probe::probe_client(&ctx.runtime) else {
            ctx.state.set_mirrors(statuses);
            return;
        };

        // Always check the primary alongside the candidates
        let mut candidates = vec![req.url.clone()];
        candidates.extend(req.mirrors.iter().cloned());
        let (valid, errors) =
            probe::probe_mirrors(&client, &candidates, file_size, ctx.runtime.probe_timeout).await;

        for (url, error) in &errors {
            tracing::warn!(url = %url, error = %error, "Mirror failed probing");
        }

        for mirror in &req.mirrors {
            if mirror == &req.url {
                continue;
            }
            if valid.contains(mirror) {
                statuses.push(MirrorStatus {
                    url: mirror.clone(),
                    active: true,
                    error: false,
                });
                active.push(mirror.clone());
            } else {
                statuses.push(MirrorStatus {
                    url: mirror.clone(),
                    active: false,
                    error: true,
                });
            }
        }
        tracing::info!(
            candidates = req.mirrors.len(),
            active = active.len(),
            "Mirror probing complete"
        );
    }

    ctx.state.set_mirrors(statuses);
}

/// Snapshot remaining work and persist the pause record.
async fn finalize_pause(
    req: &DownloadRequest,
    ctx: &EngineContext,
    file_size: u64,
    dest: &Path,
    filename: &str,
    queue: &TaskQueue,
    registry: &ActiveRegistry,
) -> Result<DownloadOutcome> {
    // Active remainders first, then whatever the queue still held.
    // Hedged duplicates are excluded on both paths: their ranges are owned
    // by the original task or its requeue.
    let mut remaining = registry.remaining_tasks();
    remaining.extend(
        queue
            .drain_remaining()
            .into_iter()
            .filter(|item| !item.hedge)
            .map(|item| item.task),
    );
    remaining.sort_by_key(|t| t.offset);

    let remaining_bytes: u64 = remaining.iter().map(|t| t.length).sum();
    let computed_downloaded = file_size.saturating_sub(remaining_bytes);
    let total_elapsed = ctx.state.elapsed();

    let (chunk_bitmap, chunk_size) = ctx.state.bitmap_snapshot().unwrap_or_default();
    ctx.state.finalize_pause(computed_downloaded, total_elapsed);

    let state = DownloadState {
        url: req.url.clone(),
        id: req.id,
        dest_path: dest.to_path_buf(),
        total_size: file_size,
        downloaded: computed_downloaded,
        tasks: remaining,
        filename: filename.to_string(),
        elapsed_ns: total_elapsed.as_nanos() as i64,
        mirrors: req.mirrors.clone(),
        chunk_bitmap,
        chunk_size,
    };
    ctx.db.save_state(&state).await?;

    tracing::info!(
        downloaded = computed_downloaded,
        remaining_tasks = state.tasks.len(),
        remaining_bytes,
        "Download paused, state saved"
    );

    Ok(DownloadOutcome::Paused)
}

/// Atomic rename with the benign-race escape hatch.
fn finalize_rename(working: &Path, dest: &Path, file_size: u64) -> Result<()> {
    match std::fs::rename(working, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Someone may have renamed it already; success if the
            // destination is in place at the expected size
            if is_already_complete(dest, file_size) {
                tracing::debug!(
                    dest = %dest.display(),
                    "Rename raced with another finisher, destination already correct"
                );
                Ok(())
            } else {
                Err(Error::Io(e))
            }
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// The single-connection path.
async fn sequential_download(
    req: &DownloadRequest,
    ctx: &EngineContext,
    dest: &Path,
) -> Result<DownloadOutcome> {
    let working = utils::working_path(dest);
    let file = Arc::new(
        std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&working)?,
    );

    let file_size = ctx.state.total_size();
    if file_size > 0 {
        file.set_len(file_size)?;
    }
    // Chunk state from an aborted concurrent attempt must not gate the
    // sequential accounting
    ctx.state.clear_bitmap();
    ctx.state.store_downloaded(0);
    ctx.state.sync_session_start();

    let download_token = ctx.cancel.child_token();
    ctx.state.set_cancel_token(download_token.clone());

    // Only the primary is used sequentially; publish it for consistency
    if ctx.state.mirrors().is_empty() {
        ctx.state.set_mirrors(vec![MirrorStatus {
            url: req.url.clone(),
            active: true,
            error: false,
        }]);
    }

    let seq_ctx = SequentialContext {
        url: req.url.clone(),
        headers: Arc::new(req.headers.clone()),
        file: file.clone(),
        state: ctx.state.clone(),
        runtime: ctx.runtime.clone(),
        // Backoff per the shared policy, attempt cap from the task budget
        retry: RetryConfig {
            max_attempts: ctx.runtime.max_task_retries,
            ..ctx.retry.clone()
        },
        cancel: download_token,
    };

    match sequential::download_sequential(&seq_ctx).await? {
        DownloadOutcome::Paused => {
            // A no-range source cannot resume mid-file; the next run starts
            // over. No resume record is written.
            tracing::info!(url = %req.url, "Sequential download paused");
            Ok(DownloadOutcome::Paused)
        }
        DownloadOutcome::Completed => {
            file.sync_all()?;
            // Release every handle before the rename
            drop(seq_ctx);
            drop(file);
            let final_size = ctx.state.total_size();
            finalize_rename(&working, dest, final_size)?;
            ctx.db.delete_state(req.id).await?;
            Ok(DownloadOutcome::Completed)
        }
    }
}
