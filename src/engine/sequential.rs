//! Single-connection fallback downloader.
//!
//! Used when the server does not honor range requests, when the object size
//! is unknown, or when the caller forces it. Streams the whole body in order
//! with positional writes; a transient mid-stream failure restarts the
//! transfer with backoff (there is no range to re-request).

use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{RetryConfig, RuntimeOptions};
use crate::error::{DownloadError, Error, Result};
use crate::retry::download_with_retry;
use crate::types::DownloadOutcome;

use super::progress::ProgressState;

/// Everything the sequential downloader needs.
pub(crate) struct SequentialContext {
    /// Source URL
    pub url: String,
    /// Caller headers forwarded verbatim
    pub headers: Arc<HashMap<String, String>>,
    /// The working file
    pub file: Arc<File>,
    /// Shared counters (no bitmap in sequential mode)
    pub state: Arc<ProgressState>,
    /// Engine tuning
    pub runtime: Arc<RuntimeOptions>,
    /// Backoff policy for full-transfer restarts (attempt cap comes from the
    /// task retry budget)
    pub retry: RetryConfig,
    /// Download-wide cancellation (pause or delete)
    pub cancel: CancellationToken,
}

/// Download the object on a single connection.
///
/// Returns [`DownloadOutcome::Paused`] when the pause flag caused the
/// cancellation, `Err(Cancelled)` for a delete. Transient stream failures
/// restart the transfer from byte zero with exponential backoff.
pub(crate) async fn download_sequential(ctx: &SequentialContext) -> Result<DownloadOutcome> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .read_timeout(ctx.runtime.stall_timeout)
        .user_agent(ctx.runtime.user_agent.clone())
        .build()?;

    download_with_retry(&ctx.retry, || stream_once(ctx, &client)).await
}

/// One full streaming attempt, starting over from byte zero.
async fn stream_once(ctx: &SequentialContext, client: &reqwest::Client) -> Result<DownloadOutcome> {
    // Every attempt restarts the transfer; reset the accounting with it
    ctx.state.store_downloaded(0);
    ctx.state.sync_session_start();

    let mut request = client.get(&ctx.url);
    for (key, value) in ctx.headers.iter() {
        request = request.header(key, value);
    }

    let response = tokio::select! {
        response = request.send() => response?,
        _ = ctx.cancel.cancelled() => return cancelled_outcome(ctx),
    };

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Download(DownloadError::FatalStatus {
            url: ctx.url.clone(),
            status: status.as_u16(),
        }));
    }

    let mut response = response;
    let mut offset = 0u64;

    loop {
        let chunk = tokio::select! {
            chunk = response.chunk() => chunk,
            _ = ctx.cancel.cancelled() => return cancelled_outcome(ctx),
        };

        match chunk? {
            Some(bytes) => {
                write_at(&ctx.file, &bytes, offset)?;
                ctx.state.mark_bytes(offset, bytes.len() as u64);
                offset += bytes.len() as u64;
            }
            None => break,
        }
    }

    let total = ctx.state.total_size();
    if total > 0 && offset < total {
        return Err(Error::Download(DownloadError::ShortRead {
            offset: 0,
            expected: total,
            got: offset,
        }));
    }
    if total == 0 {
        // The probe could not size the object; the stream defines it
        ctx.state.set_total_size(offset);
    }

    Ok(DownloadOutcome::Completed)
}

fn cancelled_outcome(ctx: &SequentialContext) -> Result<DownloadOutcome> {
    if ctx.state.is_paused() {
        Ok(DownloadOutcome::Paused)
    } else {
        Err(Error::Cancelled)
    }
}

/// Positional write that never moves the shared file cursor.
#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset).map_err(Error::Io)
}

/// Positional write that never moves the shared file cursor.
#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
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
