//! Update Batcher (§4.F): coalesces per-segment progress updates so the
//! Segment State Store sees one write per segment per flush interval instead
//! of one write per chunk.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::error::DownloadError;
use super::model::{DownloadId, SegmentState};
use super::store::Store;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PendingSegmentUpdate {
    pub(crate) bytes_written: Option<u64>,
    pub(crate) state: Option<SegmentState>,
    pub(crate) retry_count: Option<u32>,
}

impl PendingSegmentUpdate {
    /// Later writes win per field; a `None` from a later update never
    /// clobbers an earlier non-`None` value for the same field.
    fn merge(&mut self, other: PendingSegmentUpdate) {
        if other.bytes_written.is_some() {
            self.bytes_written = other.bytes_written;
        }
        if other.state.is_some() {
            self.state = other.state;
        }
        if other.retry_count.is_some() {
            self.retry_count = other.retry_count;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlushCounters {
    pub queued: u64,
    pub saved: u64,
}

/// Buffers pending per-segment writes and the per-download percent/bytes
/// update in memory, and flushes both to the Store in one transaction
/// either on an explicit call or once `flush_interval` has elapsed since
/// the last flush.
pub struct UpdateBatcher {
    download_id: DownloadId,
    pending: HashMap<usize, PendingSegmentUpdate>,
    pending_progress: Option<(f64, u64)>,
    last_flush: Instant,
    flush_interval: Duration,
    counters: FlushCounters,
}

impl UpdateBatcher {
    pub fn new(download_id: DownloadId, flush_interval: Duration) -> Self {
        UpdateBatcher {
            download_id,
            pending: HashMap::new(),
            pending_progress: None,
            last_flush: Instant::now(),
            flush_interval,
            counters: FlushCounters::default(),
        }
    }

    pub fn queue_progress(&mut self, segment_index: usize, bytes_written: u64) {
        self.counters.queued += 1;
        self.pending.entry(segment_index).or_default().merge(PendingSegmentUpdate {
            bytes_written: Some(bytes_written),
            state: None,
            retry_count: None,
        });
    }

    pub fn queue_state(&mut self, segment_index: usize, state: SegmentState) {
        self.counters.queued += 1;
        self.pending.entry(segment_index).or_default().merge(PendingSegmentUpdate {
            bytes_written: None,
            state: Some(state),
            retry_count: None,
        });
    }

    pub fn queue_retry_count(&mut self, segment_index: usize, retry_count: u32) {
        self.counters.queued += 1;
        self.pending.entry(segment_index).or_default().merge(PendingSegmentUpdate {
            bytes_written: None,
            state: None,
            retry_count: Some(retry_count),
        });
    }

    /// Queues the download's aggregate percent/bytes row (§4.F's second
    /// buffer, keyed by `download_id` rather than segment index).
    pub fn queue_download_progress(&mut self, percent: f64, downloaded_bytes: u64) {
        self.counters.queued += 1;
        self.pending_progress = Some((percent, downloaded_bytes));
    }

    pub fn due(&self) -> bool {
        self.has_pending() && self.last_flush.elapsed() >= self.flush_interval
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.pending_progress.is_some()
    }

    pub fn counters(&self) -> FlushCounters {
        self.counters
    }

    /// Drains both buffers and commits them to the Store inside one
    /// transaction (§4.B, §4.F). A failed commit is logged and the drained
    /// batch is re-queued in full rather than aborting the fetch.
    pub async fn flush(&mut self, store: &Store) -> Result<(), DownloadError> {
        self.last_flush = Instant::now();
        if !self.has_pending() {
            return Ok(());
        }
        let batch: Vec<(usize, PendingSegmentUpdate)> = self.pending.drain().collect();
        let progress = self.pending_progress.take();

        let result = store.commit_batch(self.download_id, &batch, progress).await;
        match result {
            Ok(()) => {
                self.counters.saved += batch.len() as u64 + progress.map_or(0, |_| 1);
            }
            Err(e) => {
                tracing::warn!(error = %e, segment_count = batch.len(), "batch commit failed, re-queuing");
                for (segment_index, update) in batch {
                    self.pending.entry(segment_index).or_default().merge(update);
                }
                if self.pending_progress.is_none() {
                    self.pending_progress = progress;
                }
            }
        }
        Ok(())
    }
}
