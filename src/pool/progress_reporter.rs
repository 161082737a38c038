//! Batched progress event emission for active downloads.

use std::time::Duration;

use crate::types::{Event, ProgressUpdate};

use super::HttpDownloader;

/// Interval between progress update emissions
const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

impl HttpDownloader {
    /// Start the progress reporter task.
    ///
    /// Every tick it snapshots the active downloads and emits one
    /// [`Event::Progress`] per download plus a single
    /// [`Event::BatchProgress`] when more than one is running, so consumers
    /// can pick whichever granularity they want.
    pub(crate) fn start_progress_reporter(&self) -> tokio::task::JoinHandle<()> {
        let active_downloads = self.queue_state.active_downloads.clone();
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_UPDATE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let snapshot: Vec<_> = {
                            let guard = active_downloads.lock().await;
                            guard.iter().map(|(id, h)| (*id, h.state.clone())).collect()
                        };
                        if snapshot.is_empty() {
                            continue;
                        }

                        let updates: Vec<ProgressUpdate> = snapshot
                            .iter()
                            .map(|(id, state)| ProgressUpdate {
                                id: *id,
                                downloaded: state.downloaded(),
                                total: state.total_size(),
                                speed_bps: state.speed_bps(),
                                elapsed_ms: state.elapsed().as_millis() as u64,
                            })
                            .collect();

                        for update in &updates {
                            event_tx.send(Event::Progress(update.clone())).ok();
                        }
                        if updates.len() > 1 {
                            event_tx.send(Event::BatchProgress { updates }).ok();
                        }
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        })
    }
}
